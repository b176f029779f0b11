//! Encrypted local vault for sessions and provider credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       VaultStore                         │
//! │  - load / save / update whole document   │
//! │  - corrupt data loads as empty           │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, nonce || ciphertext      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       KeyManager                         │
//! │  - 32-byte key file, mode 0600           │
//! │  - age-based rotation                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use kitvault::config::StorageConfig;
//! use kitvault::vault;
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = vault::open(&StorageConfig::default())?;
//!
//! store.update(|doc| doc.set_credential("client_key", "aw1234"))?;
//!
//! if let Some((username, session)) = store.load().current_session() {
//!     println!("{} expires at {:?}", username, session.expires_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - The whole document is sealed with AES-256-GCM under a fresh nonce per save
//! - Key file and vault file are owner read/write only
//! - Writes go through a temp file and rename, so readers never see partial data
//! - Key rotation re-encrypts the loaded document under the new key

use crate::config::StorageConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

mod encryption;
mod fs;
mod key;
mod store;

pub use encryption::{decrypt, encrypt, KEY_SIZE};
pub use key::{EncryptionKey, KeyIoError, KeyManager, Rotation};
pub use store::{LoadStatus, VaultStore};

/// Default tier label for sessions created by the login flow.
pub const DEFAULT_TIER: &str = "enterprise";

/// Opens the vault described by `config`, creating or rotating the key as needed.
///
/// When the key is older than `config.key_max_age_days`, the document is
/// decrypted under the old key, the key is rotated, and the document is
/// re-saved under the new key before this returns.
pub fn open(config: &StorageConfig) -> Result<VaultStore> {
    let keys = KeyManager::new(&config.key_path);
    let key = keys.ensure_key()?;
    let mut store = VaultStore::new(&config.vault_path, key);

    let max_age = Duration::try_days(config.key_max_age_days).with_context(|| {
        format!(
            "key_max_age_days {} is out of range",
            config.key_max_age_days
        )
    })?;
    let rotation = keys.rotate_if_stale(max_age)?;
    if rotation.is_rotated() {
        store
            .rekey(rotation.into_key())
            .context("Failed to re-encrypt vault after key rotation")?;
    }

    Ok(store)
}

/// Authenticated state of one user against the OAuth provider.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token expires; `None` means no declared expiry
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// When the session was first created by a login
    pub created_at: DateTime<Utc>,

    /// Free-form tier/role label
    #[serde(default = "default_tier")]
    pub tier: String,
}

fn default_tier() -> String {
    DEFAULT_TIER.to_string()
}

impl Session {
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            created_at: Utc::now(),
            tier: default_tier(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// True once `now` has reached the declared expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// True when the token expires within `window` of `now` (or already has).
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        match now.checked_add_signed(window) {
            Some(limit) => expires_at <= limit,
            // Window reaches past the end of the calendar
            None => window > Duration::zero(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .field("tier", &self.tier)
            .finish()
    }
}

/// Root object persisted in the vault file.
///
/// `current_user`, when set, always names an entry in `users`; the mutators
/// below are the only way to change it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultDocument {
    #[serde(default)]
    users: BTreeMap<String, Session>,
    #[serde(default)]
    credentials: BTreeMap<String, String>,
    #[serde(default)]
    current_user: Option<String>,
}

impl VaultDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.credentials.is_empty() && self.current_user.is_none()
    }

    pub fn users(&self) -> impl Iterator<Item = (&str, &Session)> {
        self.users.iter().map(|(name, session)| (name.as_str(), session))
    }

    pub fn session(&self, username: &str) -> Option<&Session> {
        self.users.get(username)
    }

    pub fn current_user(&self) -> Option<&str> {
        self.current_user.as_deref()
    }

    /// The active user and their session.
    pub fn current_session(&self) -> Option<(&str, &Session)> {
        let username = self.current_user.as_deref()?;
        self.users.get(username).map(|session| (username, session))
    }

    /// Stores `session` for `username` and makes it the active session.
    pub fn login(&mut self, username: &str, session: Session) {
        self.users.insert(username.to_string(), session);
        self.current_user = Some(username.to_string());
    }

    /// Replaces the session of an existing user. Returns false if the user is unknown.
    pub fn replace_session(&mut self, username: &str, session: Session) -> bool {
        match self.users.get_mut(username) {
            Some(existing) => {
                *existing = session;
                true
            }
            None => false,
        }
    }

    /// Makes an existing user active. Returns false if the user is unknown.
    pub fn set_current_user(&mut self, username: &str) -> bool {
        if !self.users.contains_key(username) {
            return false;
        }
        self.current_user = Some(username.to_string());
        true
    }

    /// Removes the user's session, clearing `current_user` if it named them.
    ///
    /// Returns true if a session was removed.
    pub fn logout(&mut self, username: &str) -> bool {
        let removed = self.users.remove(username).is_some();
        if self.current_user.as_deref() == Some(username) {
            self.current_user = None;
        }
        removed
    }

    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials.get(name).map(String::as_str)
    }

    pub fn credential_names(&self) -> impl Iterator<Item = &str> {
        self.credentials.keys().map(String::as_str)
    }

    pub fn set_credential(&mut self, name: &str, secret: &str) {
        self.credentials.insert(name.to_string(), secret.to_string());
    }

    pub fn remove_credential(&mut self, name: &str) -> bool {
        self.credentials.remove(name).is_some()
    }

    /// Clears a `current_user` that names no session. Returns true if it did.
    pub(crate) fn repair(&mut self) -> bool {
        match &self.current_user {
            Some(username) if !self.users.contains_key(username) => {
                warn!(username = %username, "Active user has no session, clearing");
                self.current_user = None;
                true
            }
            _ => false,
        }
    }
}

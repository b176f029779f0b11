//! Keeps stored sessions usable.
//!
//! Sessions whose access token expires within the refresh window are renewed
//! through the provider's token endpoint (`grant_type=refresh_token`) and the
//! result is written back to the vault. Transient failures are retried with
//! [`RetryPolicy`]; a rejected refresh token means the user has to log in again.

mod retry;

pub use retry::{RetryError, RetryPolicy};

use crate::config::RefreshConfig;
use crate::oauth::{AuthError, TokenClient, TokenEndpointError};
use crate::vault::{Session, VaultStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

/// Refreshes sessions that are about to expire.
#[derive(Clone)]
pub struct TokenRefresher {
    client: TokenClient,
    policy: RetryPolicy,
    window: Duration,
}

impl TokenRefresher {
    pub fn new(client: TokenClient, policy: RetryPolicy, window: Duration) -> Self {
        Self {
            client,
            policy,
            window,
        }
    }

    pub fn from_config(client: TokenClient, config: &RefreshConfig) -> Result<Self> {
        let window = Duration::try_seconds(config.window_seconds).with_context(|| {
            format!(
                "refresh window_seconds {} is out of range",
                config.window_seconds
            )
        })?;
        Ok(Self::new(client, RetryPolicy::from(config), window))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// True if `session` expires within the refresh window of `now`
    pub fn needs_refresh(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.expires_within(self.window, now)
    }

    /// Returns a session that is safe to use right now.
    ///
    /// Sessions without an expiry, or expiring outside the window, come back
    /// unchanged without any network call. A session inside the window with
    /// no refresh token is still returned until it actually expires.
    pub async fn ensure_fresh(
        &self,
        vault: &VaultStore,
        username: &str,
        session: Session,
    ) -> Result<Session, AuthError> {
        let now = Utc::now();
        if !self.needs_refresh(&session, now) {
            return Ok(session);
        }

        if session.refresh_token.is_none() {
            if session.is_expired_at(now) {
                warn!(username = %username, "Session expired and has no refresh token");
                return Err(AuthError::NoRefreshToken);
            }
            debug!(username = %username, "Session expiring soon but has no refresh token");
            return Ok(session);
        }

        self.refresh(vault, username, session).await
    }

    /// Refreshes `session` unconditionally and persists the result.
    pub async fn refresh(
        &self,
        vault: &VaultStore,
        username: &str,
        session: Session,
    ) -> Result<Session, AuthError> {
        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or(AuthError::NoRefreshToken)?;

        info!(
            username = %username,
            expires_at = ?session.expires_at,
            "Refreshing access token"
        );

        let client = &self.client;
        let token = refresh_token.as_str();
        let grant = self
            .policy
            .run(
                |_| client.refresh(token),
                TokenEndpointError::is_transient,
            )
            .await
            .map_err(|e| {
                error!(username = %username, error = %e, "Token refresh failed");
                match e {
                    // Unreadable 2xx body says nothing about the refresh token
                    RetryError::Permanent {
                        attempts,
                        error: error @ TokenEndpointError::InvalidResponse { .. },
                    } => AuthError::RefreshFailed {
                        attempts,
                        reason: error.to_string(),
                    },
                    RetryError::Permanent { error, .. } => AuthError::RefreshRejected {
                        status: error.status().unwrap_or_default(),
                        payload: error.payload(),
                    },
                    RetryError::Exhausted { attempts, error } => AuthError::RefreshFailed {
                        attempts,
                        reason: error.to_string(),
                    },
                }
            })?;

        let rotated = grant.refresh_token.is_some();
        let refreshed = Session {
            access_token: grant.access_token.clone(),
            refresh_token: grant.refresh_token.clone().or(session.refresh_token),
            expires_at: grant.expires_at(Utc::now()),
            ..session
        };

        let stored = refreshed.clone();
        let replaced = vault
            .update(|doc| doc.replace_session(username, stored))
            .map_err(|e| AuthError::Storage(format!("{:#}", e)))?;
        if !replaced {
            warn!(username = %username, "User no longer in vault, refreshed session not stored");
        }

        info!(
            username = %username,
            refresh_token_rotated = rotated,
            expires_at = ?refreshed.expires_at,
            "Access token refreshed"
        );

        Ok(refreshed)
    }

    /// The current user's session, refreshed if needed.
    ///
    /// Returns `None` when nobody is logged in.
    pub async fn current_session(
        &self,
        vault: &VaultStore,
    ) -> Result<Option<(String, Session)>, AuthError> {
        let doc = vault.load();
        let Some((username, session)) = doc.current_session() else {
            return Ok(None);
        };
        let username = username.to_string();
        let session = self.ensure_fresh(vault, &username, session.clone()).await?;

        Ok(Some((username, session)))
    }
}

//! Lifecycle of the vault encryption key.
//!
//! One key file holds the raw 32-byte key. Its mtime is the key's creation
//! time, which drives age-based rotation. Rotation replaces the file
//! atomically; anything sealed under the previous key can no longer be opened,
//! so callers holding decrypted state must re-save it right away (see
//! [`super::VaultStore::rekey`]).

use super::encryption::{self, KEY_SIZE};
use super::fs::write_private;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// The active symmetric key.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: Zeroizing<Vec<u8>>,
    created_at: DateTime<Utc>,
}

impl EncryptionKey {
    pub(crate) fn new(bytes: Zeroizing<Vec<u8>>, created_at: DateTime<Utc>) -> Self {
        Self { bytes, created_at }
    }

    /// Raw key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// When the key file was written.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Age of the key relative to `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Outcome of [`KeyManager::rotate_if_stale`].
#[derive(Debug)]
pub enum Rotation {
    /// Key is younger than the threshold and was kept.
    Unchanged(EncryptionKey),
    /// Key was replaced; data sealed under the old key must be re-saved.
    Rotated(EncryptionKey),
}

impl Rotation {
    pub fn is_rotated(&self) -> bool {
        matches!(self, Rotation::Rotated(_))
    }

    pub fn into_key(self) -> EncryptionKey {
        match self {
            Rotation::Unchanged(key) | Rotation::Rotated(key) => key,
        }
    }
}

/// Key file errors. Always fatal: without a key the vault cannot be opened.
#[derive(Debug)]
pub enum KeyIoError {
    /// Reading, writing or inspecting the key file failed
    Io { path: PathBuf, source: io::Error },
    /// Key file exists but does not hold a 32-byte key
    Malformed { path: PathBuf, len: usize },
}

impl fmt::Display for KeyIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyIoError::Io { path, source } => {
                write!(f, "Key file I/O error at {}: {}", path.display(), source)
            }
            KeyIoError::Malformed { path, len } => write!(
                f,
                "Key file {} holds {} bytes, expected {}",
                path.display(),
                len,
                KEY_SIZE
            ),
        }
    }
}

impl std::error::Error for KeyIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyIoError::Io { source, .. } => Some(source),
            KeyIoError::Malformed { .. } => None,
        }
    }
}

/// Owns the key file at a fixed path.
#[derive(Clone, Debug)]
pub struct KeyManager {
    path: PathBuf,
}

impl KeyManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the active key, generating and persisting one if the file is absent.
    pub fn ensure_key(&self) -> Result<EncryptionKey, KeyIoError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No encryption key found, generating one");
            return self.generate();
        }
        self.read()
    }

    /// Replaces the key when its file is older than `max_age`.
    pub fn rotate_if_stale(&self, max_age: Duration) -> Result<Rotation, KeyIoError> {
        let current = self.ensure_key()?;
        let age = current.age_at(Utc::now());

        if age <= max_age {
            debug!(age_days = age.num_days(), "Encryption key is current");
            return Ok(Rotation::Unchanged(current));
        }

        warn!(
            path = %self.path.display(),
            age_days = age.num_days(),
            max_age_days = max_age.num_days(),
            "Encryption key is stale, rotating"
        );
        Ok(Rotation::Rotated(self.rotate()?))
    }

    /// Unconditionally replaces the key file with fresh key material.
    pub fn rotate(&self) -> Result<EncryptionKey, KeyIoError> {
        let key = self.generate()?;
        info!(path = %self.path.display(), "Encryption key rotated");
        Ok(key)
    }

    fn generate(&self) -> Result<EncryptionKey, KeyIoError> {
        let bytes = encryption::generate_key();
        write_private(&self.path, &bytes).map_err(|source| self.io_error(source))?;
        let created_at = self.modified_at()?;
        Ok(EncryptionKey::new(bytes, created_at))
    }

    fn read(&self) -> Result<EncryptionKey, KeyIoError> {
        let bytes = Zeroizing::new(std::fs::read(&self.path).map_err(|e| self.io_error(e))?);
        if encryption::validate_key(&bytes).is_err() {
            return Err(KeyIoError::Malformed {
                path: self.path.clone(),
                len: bytes.len(),
            });
        }
        let created_at = self.modified_at()?;
        Ok(EncryptionKey::new(bytes, created_at))
    }

    fn modified_at(&self) -> Result<DateTime<Utc>, KeyIoError> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| self.io_error(e))?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn io_error(&self, source: io::Error) -> KeyIoError {
        KeyIoError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::TempDir;

    fn age_key_file(path: &Path, days: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - StdDuration::from_secs(days * 24 * 3600))
            .unwrap();
    }

    #[test]
    fn test_ensure_key_generates_when_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kit.key");
        let manager = KeyManager::new(&path);

        let key = manager.ensure_key().unwrap();

        assert_eq!(key.as_bytes().len(), KEY_SIZE);
        assert_eq!(fs::read(&path).unwrap(), key.as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kit.key");
        KeyManager::new(&path).ensure_key().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_ensure_key_reuses_existing() {
        let dir = TempDir::new().unwrap();
        let manager = KeyManager::new(dir.path().join("kit.key"));

        let first = manager.ensure_key().unwrap();
        let second = manager.ensure_key().unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_malformed_key_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kit.key");
        fs::write(&path, b"too-short").unwrap();

        let err = KeyManager::new(&path).ensure_key().unwrap_err();
        assert!(matches!(err, KeyIoError::Malformed { len: 9, .. }));

        // The bad file is left in place, never silently regenerated
        assert_eq!(fs::read(&path).unwrap(), b"too-short");
    }

    #[test]
    fn test_unreadable_location_is_io_error() {
        let dir = TempDir::new().unwrap();
        // A directory where the key file should be
        let path = dir.path().join("kit.key");
        fs::create_dir(&path).unwrap();

        let err = KeyManager::new(&path).ensure_key().unwrap_err();
        assert!(matches!(err, KeyIoError::Io { .. }));
    }

    #[test]
    fn test_fresh_key_is_not_rotated() {
        let dir = TempDir::new().unwrap();
        let manager = KeyManager::new(dir.path().join("kit.key"));
        let original = manager.ensure_key().unwrap();

        let rotation = manager.rotate_if_stale(Duration::days(30)).unwrap();

        assert!(!rotation.is_rotated());
        assert_eq!(rotation.into_key().as_bytes(), original.as_bytes());
    }

    #[test]
    fn test_stale_key_is_rotated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kit.key");
        let manager = KeyManager::new(&path);
        let original = manager.ensure_key().unwrap();
        age_key_file(&path, 31);

        let rotation = manager.rotate_if_stale(Duration::days(30)).unwrap();

        assert!(rotation.is_rotated());
        let key = rotation.into_key();
        assert_ne!(key.as_bytes(), original.as_bytes());
        assert_eq!(fs::read(&path).unwrap(), key.as_bytes());
        assert!(key.age_at(Utc::now()) < Duration::minutes(1));
    }

    #[test]
    fn test_key_age_comes_from_file_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kit.key");
        let manager = KeyManager::new(&path);
        manager.ensure_key().unwrap();
        age_key_file(&path, 10);

        let key = manager.ensure_key().unwrap();
        assert_eq!(key.age_at(Utc::now()).num_days(), 10);
    }

    #[test]
    fn test_debug_redacts_key_bytes() {
        let key = EncryptionKey::new(Zeroizing::new(vec![0xAB; 32]), Utc::now());
        let debug = format!("{:?}", key);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("171, 171"));
    }
}

//! Encrypted document storage in a single file.
//!
//! The vault holds one JSON document, sealed with AES-256-GCM. Every save
//! replaces the whole file; there is no incremental patching.

use super::fs::write_private;
use super::{encryption, EncryptionKey, VaultDocument};
use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How [`VaultStore::load_with_status`] obtained its document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    /// No vault file yet; the document is empty
    Missing,
    /// File decrypted and parsed
    Loaded,
    /// File existed but could not be read, decrypted or parsed; the document is
    /// empty and everything previously stored is lost
    Recovered { reason: String },
}

/// Encrypted vault backed by one file.
///
/// # Concurrency
/// - No cross-process locking: two processes saving the same file race, and
///   the last writer wins
/// - Within one process callers are expected to run operations sequentially
pub struct VaultStore {
    path: PathBuf,
    key: EncryptionKey,
}

impl VaultStore {
    /// Creates a store for `path` sealed under `key`. Nothing is read yet.
    pub fn new<P: AsRef<Path>>(path: P, key: EncryptionKey) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    /// Loads the document, falling back to an empty one on any failure.
    pub fn load(&self) -> VaultDocument {
        self.load_with_status().0
    }

    /// Loads the document and reports whether prior data was discarded.
    pub fn load_with_status(&self) -> (VaultDocument, LoadStatus) {
        match self.try_load() {
            Ok(Some(mut doc)) => {
                doc.repair();
                (doc, LoadStatus::Loaded)
            }
            Ok(None) => {
                debug!(path = %self.path.display(), "No vault file, starting empty");
                (VaultDocument::new(), LoadStatus::Missing)
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(
                    path = %self.path.display(),
                    error = %reason,
                    "Vault could not be decrypted; continuing with an EMPTY vault, stored sessions and credentials are lost"
                );
                (VaultDocument::new(), LoadStatus::Recovered { reason })
            }
        }
    }

    fn try_load(&self) -> Result<Option<VaultDocument>> {
        let blob = match std::fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read vault file"),
        };

        let plaintext = encryption::decrypt(&blob, self.key.as_bytes())
            .context("Failed to decrypt vault")?;
        let doc = serde_json::from_slice(&plaintext).context("Vault content is not valid")?;

        Ok(Some(doc))
    }

    /// Encrypts and writes the whole document, owner-only.
    pub fn save(&self, doc: &VaultDocument) -> Result<()> {
        let plaintext = serde_json::to_vec(doc).context("Failed to serialize vault")?;
        let blob =
            encryption::encrypt(&plaintext, self.key.as_bytes()).context("Failed to encrypt vault")?;

        write_private(&self.path, &blob)
            .with_context(|| format!("Failed to write vault file {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = blob.len(), "Vault saved");
        Ok(())
    }

    /// Loads the current document, applies `mutate`, and saves it.
    ///
    /// The document is re-read from disk first so the change lands on the
    /// latest persisted state rather than a stale in-memory copy.
    pub fn update<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut VaultDocument) -> T,
    {
        let mut doc = self.load();
        let out = mutate(&mut doc);
        self.save(&doc)?;
        Ok(out)
    }

    /// Re-encrypts the stored document under `key` and switches to it.
    ///
    /// Must be called right after a key rotation, while the old key is still
    /// held by this store.
    pub fn rekey(&mut self, key: EncryptionKey) -> Result<()> {
        let (doc, status) = self.load_with_status();
        self.key = key;

        if status == LoadStatus::Missing {
            return Ok(());
        }
        self.save(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Session;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;
    use zeroize::Zeroizing;

    fn key(byte: u8) -> EncryptionKey {
        EncryptionKey::new(Zeroizing::new(vec![byte; 32]), Utc::now())
    }

    fn create_test_store(dir: &TempDir) -> VaultStore {
        VaultStore::new(dir.path().join("kit.vault"), key(0))
    }

    fn create_test_document() -> VaultDocument {
        let mut doc = VaultDocument::new();
        doc.set_credential("client_key", "aw-client");
        doc.set_credential("client_secret", "aw-secret");
        doc.login(
            "bob",
            Session::new("bob-token".to_string(), None, None).with_tier("basic"),
        );
        doc.login(
            "alice",
            Session::new(
                "alice-token".to_string(),
                Some("alice-refresh".to_string()),
                Some(Utc::now() + Duration::hours(2)),
            ),
        );
        doc
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        let doc = create_test_document();

        store.save(&doc).expect("Failed to save");
        let (loaded, status) = store.load_with_status();

        assert_eq!(status, LoadStatus::Loaded);
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_file_is_not_plaintext() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_document()).unwrap();

        let raw = std::fs::read(store.path()).unwrap();
        let raw = String::from_utf8_lossy(&raw);
        assert!(!raw.contains("alice-token"));
        assert!(!raw.contains("currentUser"));
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let (doc, status) = store.load_with_status();
        assert_eq!(status, LoadStatus::Missing);
        assert!(doc.is_empty());
    }

    #[test]
    fn test_garbage_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        std::fs::write(store.path(), b"this is not a vault at all, just some bytes").unwrap();

        let (doc, status) = store.load_with_status();
        assert!(matches!(status, LoadStatus::Recovered { .. }));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_wrong_key_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_document()).unwrap();

        let other = VaultStore::new(store.path(), key(1));
        assert!(other.load().is_empty());
    }

    #[test]
    fn test_encrypted_non_json_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        let blob = encryption::encrypt(b"[1, 2, 3]", store.key().as_bytes()).unwrap();
        std::fs::write(store.path(), blob).unwrap();

        let (doc, status) = store.load_with_status();
        assert!(matches!(status, LoadStatus::Recovered { .. }));
        assert!(doc.is_empty());
    }

    #[test]
    fn test_load_clears_dangling_current_user() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        let blob = encryption::encrypt(
            br#"{"users":{},"credentials":{},"currentUser":"ghost"}"#,
            store.key().as_bytes(),
        )
        .unwrap();
        std::fs::write(store.path(), blob).unwrap();

        assert_eq!(store.load().current_user(), None);
    }

    #[test]
    fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let existed = store
            .update(|doc| {
                doc.set_credential("shop_secret", "xyz");
                doc.remove_credential("missing")
            })
            .unwrap();

        assert!(!existed);
        assert_eq!(store.load().credential("shop_secret"), Some("xyz"));
    }

    #[test]
    fn test_rekey_preserves_document() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);
        let doc = create_test_document();
        store.save(&doc).unwrap();

        store.rekey(key(9)).unwrap();

        assert_eq!(store.load(), doc);
        let stale = VaultStore::new(store.path(), key(0));
        assert!(stale.load().is_empty());
    }

    #[test]
    fn test_rekey_without_file_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = create_test_store(&dir);

        store.rekey(key(9)).unwrap();

        assert!(!store.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_vault_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&VaultDocument::new()).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

//! AES-256-GCM encryption for the vault document.
//!
//! The whole serialized document is sealed as one message. The output blob is
//! the 12-byte nonce followed by the ciphertext (which carries the GCM tag), so
//! a vault file is self-contained given the key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use zeroize::Zeroizing;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag appended to every ciphertext
const TAG_SIZE: usize = 16;

/// Generates fresh key material from the OS random number generator.
pub fn generate_key() -> Zeroizing<Vec<u8>> {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    Zeroizing::new(key.to_vec())
}

/// Validates that key material is exactly 32 bytes.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key.len()
        ));
    }
    Ok(())
}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// # Returns
/// * `Ok(blob)` - `nonce || ciphertext`
/// * `Err` - If the key is invalid or encryption fails
///
/// # Security
/// - Uses a cryptographically secure random nonce per call (never reused)
/// - Authenticated encryption (tampering detected on decrypt)
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    validate_key(key)?;

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypts a `nonce || ciphertext` blob produced by [`encrypt`].
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decrypted plaintext
/// * `Err` - If the blob is truncated, the key is wrong, or the data was tampered with
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    validate_key(key)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(anyhow!(
            "Ciphertext too short: expected at least {} bytes, got {}",
            NONCE_SIZE + TAG_SIZE,
            blob.len()
        ));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key(&[0u8; 32]).is_ok());
        assert!(validate_key(&[0u8; 16]).is_err());
        assert!(validate_key(&[0u8; 64]).is_err());
        assert!(validate_key(&[]).is_err());
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), KEY_SIZE);
        assert_ne!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let plaintext = br#"{"users":{},"credentials":{},"currentUser":null}"#;

        let blob = encrypt(plaintext, &key).expect("Encryption failed");
        assert_ne!(&blob[NONCE_SIZE..], &plaintext[..]);

        let decrypted = decrypt(&blob, &key).expect("Decryption failed");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_different_nonces() {
        let key = [0u8; 32];

        let blob1 = encrypt(b"same-plaintext", &key).unwrap();
        let blob2 = encrypt(b"same-plaintext", &key).unwrap();

        assert_ne!(blob1[..NONCE_SIZE], blob2[..NONCE_SIZE]);
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt(b"secret", &[0u8; 32]).unwrap();
        assert!(decrypt(&blob, &[1u8; 32]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0u8; 32];
        let mut blob = encrypt(b"secret", &key).unwrap();

        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert!(decrypt(&blob, &key).is_err());
    }

    #[test]
    fn test_truncated_blob_fails() {
        let key = [0u8; 32];
        assert!(decrypt(&[], &key).is_err());
        assert!(decrypt(&[0u8; NONCE_SIZE + 3], &key).is_err());
    }
}

//! AES-256-GCM sealing for vault entries.
//!
//! Every secret is sealed under its own random 96-bit nonce. Both halves are
//! stored base64-encoded next to each other.

use super::SecretString;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the master key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Master key for the vault. Held in memory only, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; KEY_SIZE]);

/// Ciphertext plus the nonce it was sealed with, both base64.
pub(crate) struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

impl VaultKey {
    /// Parses a base64-encoded 32-byte key (the `KEYLINE_ENCRYPTION_KEY` format).
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let mut bytes = BASE64
            .decode(encoded.trim())
            .context("Failed to decode base64 encryption key")?;

        if bytes.len() != KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                len
            ));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(key))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| anyhow!("Failed to create cipher: {}", e))
    }

    pub(crate) fn seal(&self, secret: &SecretString) -> Result<Sealed> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, secret.expose().as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(Sealed {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    pub(crate) fn open(&self, sealed: &Sealed) -> Result<SecretString> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce = BASE64.decode(&sealed.nonce).context("Failed to decode nonce")?;

        if nonce.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            ));
        }

        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .context("Decrypted data is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> VaultKey {
        VaultKey::from_base64(&BASE64.encode([byte; 32])).unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(VaultKey::from_base64(&BASE64.encode([0u8; 32])).is_ok());
        assert!(VaultKey::from_base64(&BASE64.encode([0u8; 16])).is_err());
        assert!(VaultKey::from_base64(&BASE64.encode([0u8; 64])).is_err());
        assert!(VaultKey::from_base64("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_and_open() {
        let key = key(7);
        let sealed = key.seal(&SecretString::new("1//refresh-abc")).unwrap();
        assert!(!sealed.ciphertext.contains("refresh-abc"));
        assert_eq!(key.open(&sealed).unwrap().expose(), "1//refresh-abc");
    }

    #[test]
    fn test_nonces_are_not_reused() {
        let key = key(0);
        let a = key.seal(&SecretString::new("same")).unwrap();
        let b = key.seal(&SecretString::new("same")).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = key(0).seal(&SecretString::new("secret")).unwrap();
        assert!(key(1).open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = key(0);
        let mut sealed = key.seal(&SecretString::new("secret")).unwrap();
        sealed.ciphertext.push('X');
        assert!(key.open(&sealed).is_err());
    }
}

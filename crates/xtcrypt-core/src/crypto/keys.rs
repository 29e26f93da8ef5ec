#![forbid(unsafe_code)]

use std::fmt;

use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroize;

use super::CryptoError;

/// Size of each half of a [`FileKey`] (256 bits).
pub const KEY_SIZE: usize = 32;

/// File-scoped key pair: an AES-256 encryption key and an HMAC-SHA256 key.
///
/// # Security
///
/// Both halves live in [`SecretBox`], which zeroes the memory on drop and
/// keeps the material out of `Debug` output. Access goes through scoped
/// callbacks so raw key bytes never escape the crypto code.
pub struct FileKey {
    enc_key: SecretBox<[u8; KEY_SIZE]>,
    mac_key: SecretBox<[u8; KEY_SIZE]>,
}

impl FileKey {
    /// Build a key from its two halves. The arguments are zeroed after copying.
    pub fn new(mut enc_key: [u8; KEY_SIZE], mut mac_key: [u8; KEY_SIZE]) -> Self {
        let key = Self {
            enc_key: SecretBox::new(Box::new(enc_key)),
            mac_key: SecretBox::new(Box::new(mac_key)),
        };
        enc_key.zeroize();
        mac_key.zeroize();
        key
    }

    /// Build a key from 64 bytes of material (encryption key || MAC key).
    pub fn from_bytes(material: &[u8]) -> Result<Self, CryptoError> {
        if material.len() != 2 * KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: 2 * KEY_SIZE,
                actual: material.len(),
            });
        }

        let mut enc_key = [0u8; KEY_SIZE];
        let mut mac_key = [0u8; KEY_SIZE];
        enc_key.copy_from_slice(&material[..KEY_SIZE]);
        mac_key.copy_from_slice(&material[KEY_SIZE..]);
        Ok(Self::new(enc_key, mac_key))
    }

    /// Generate a fresh random key pair.
    pub fn random() -> Self {
        let mut enc_key = [0u8; KEY_SIZE];
        let mut mac_key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut enc_key);
        rand::rng().fill_bytes(&mut mac_key);
        Self::new(enc_key, mac_key)
    }

    /// Execute a function with access to the AES encryption key.
    pub fn with_enc_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; KEY_SIZE]) -> R,
    {
        f(self.enc_key.expose_secret())
    }

    /// Execute a function with access to the MAC key.
    pub fn with_mac_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; KEY_SIZE]) -> R,
    {
        f(self.mac_key.expose_secret())
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileKey")
            .field("enc_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_splits_halves() {
        let mut material = [0u8; 64];
        material[..32].fill(0x11);
        material[32..].fill(0x22);

        let key = FileKey::from_bytes(&material).unwrap();
        key.with_enc_key(|k| assert_eq!(k, &[0x11; 32]));
        key.with_mac_key(|k| assert_eq!(k, &[0x22; 32]));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let result = FileKey::from_bytes(&[0u8; 48]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 64,
                actual: 48
            })
        ));
    }

    #[test]
    fn test_random_keys_differ() {
        let a = FileKey::random();
        let b = FileKey::random();
        let a_bytes = a.with_enc_key(|k| *k);
        let b_bytes = b.with_enc_key(|k| *k);
        assert_ne!(a_bytes, b_bytes);
    }

    #[test]
    fn test_debug_redacts_material() {
        let key = FileKey::new([0xAB; 32], [0xCD; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.to_lowercase().contains("abab"));
    }
}

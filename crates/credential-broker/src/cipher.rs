//! Symmetric encryption for stored secrets.

use crate::error::CredentialError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::SecretString;
use sha2::{Digest, Sha256};

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// AES-256-GCM cipher for credential secrets.
///
/// Output format: base64 of `[12 bytes nonce][ciphertext with auth tag]`.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Key given as 64 hex characters.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CredentialError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CredentialError::Config(format!("Invalid hex key: {}", e)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            CredentialError::Config(format!("Key must be 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(key))
    }

    /// Key derived as SHA-256 of a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self::new(key)
    }

    /// Hex key if the value is 64 hex characters, passphrase otherwise.
    pub fn from_config_key(value: &str) -> Result<Self, CredentialError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CredentialError::Config("encryption key is empty".into()));
        }
        if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Self::from_hex_key(value)
        } else {
            Ok(Self::from_passphrase(value))
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self.cipher.encrypt(nonce, plaintext.as_bytes())?;

        let mut data = nonce_bytes.to_vec();
        data.extend(ciphertext);
        Ok(STANDARD.encode(data))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<SecretString, CredentialError> {
        let data = STANDARD
            .decode(encoded)
            .map_err(|e| CredentialError::Encryption(format!("Invalid base64: {}", e)))?;

        if data.len() < NONCE_SIZE {
            return Err(CredentialError::Encryption("Data too short".into()));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let plaintext = self.cipher.decrypt(nonce, &data[NONCE_SIZE..])?;

        String::from_utf8(plaintext)
            .map(SecretString::new)
            .map_err(|_| CredentialError::Encryption("Decrypted secret is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = SecretCipher::from_passphrase("test passphrase");
        let encoded = cipher.encrypt("refresh-token-value").unwrap();

        assert!(!encoded.contains("refresh-token-value"));
        let decrypted = cipher.decrypt(&encoded).unwrap();
        assert_eq!(decrypted.expose_secret(), "refresh-token-value");
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = SecretCipher::new([7u8; 32]);
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let encoded = SecretCipher::new([1u8; 32]).encrypt("secret").unwrap();
        let result = SecretCipher::new([2u8; 32]).decrypt(&encoded);
        assert!(matches!(result, Err(CredentialError::Encryption(_))));
    }

    #[test]
    fn test_tampered_data_fails() {
        let cipher = SecretCipher::new([3u8; 32]);
        assert!(cipher.decrypt("AAAA").is_err());
        assert!(cipher.decrypt("not base64!").is_err());
    }

    #[test]
    fn test_config_key_forms() {
        let hex_key = "11".repeat(32);
        let from_hex = SecretCipher::from_config_key(&hex_key).unwrap();
        let direct = SecretCipher::new([0x11; 32]);
        let encoded = direct.encrypt("x").unwrap();
        assert_eq!(from_hex.decrypt(&encoded).unwrap().expose_secret(), "x");

        assert!(SecretCipher::from_config_key("a passphrase").is_ok());
        assert!(SecretCipher::from_config_key("  ").is_err());
        assert!(SecretCipher::from_hex_key("abcd").is_err());
    }
}

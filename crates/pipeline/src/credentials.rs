//! Encryption for stored mailbox passwords
//!
//! Account secrets are sealed with AES-256-GCM under a key supplied through
//! configuration (`CREDENTIALS_KEY`, 32 bytes, base64). The stored form is
//! `base64(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;
use tracing::debug;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Invalid credentials key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),
}

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    /// Build a cipher from a base64-encoded 32 byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, CredentialError> {
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| CredentialError::InvalidKey(format!("not base64: {}", e)))?;
        if key.len() != 32 {
            return Err(CredentialError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Fresh random key, base64 encoded, suitable for `CREDENTIALS_KEY`.
    pub fn generate_key() -> String {
        BASE64.encode(Aes256Gcm::generate_key(OsRng))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        if plaintext.is_empty() {
            return Err(CredentialError::Encryption(
                "Cannot encrypt empty plaintext".to_string(),
            ));
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, CredentialError> {
        let combined = BASE64.decode(encrypted.trim()).map_err(|e| {
            CredentialError::InvalidFormat(format!("Invalid base64 encoding: {}", e))
        })?;

        if combined.len() <= NONCE_SIZE {
            return Err(CredentialError::InvalidFormat(format!(
                "Encrypted data too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| {
                CredentialError::Decryption(format!(
                    "AES-GCM decryption failed (wrong key or corrupted data): {}",
                    e
                ))
            })?;

        let plaintext = String::from_utf8(plaintext).map_err(|e| {
            CredentialError::Decryption(format!("Decrypted data is not valid UTF-8: {}", e))
        })?;

        debug!("Decrypted account secret");
        Ok(plaintext)
    }
}

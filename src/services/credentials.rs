//! Access-token encryption at rest (AES-256-GCM).
//!
//! Tokens are stored as hex of `nonce (12 bytes) || ciphertext`. Each
//! encryption draws a fresh random nonce.

use std::fmt;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use thiserror::Error;

use super::{AccessToken, CredentialDecryptor};

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the GCM nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Errors from credential encryption and decryption.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The configured key is not 64 hex characters.
    #[error("secret key must be {KEY_LEN} bytes of hex")]
    InvalidKey,

    /// The stored token is not valid hex.
    #[error("encrypted token is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// The stored token is shorter than a nonce.
    #[error("encrypted token too short")]
    TooShort,

    /// Authentication failed (wrong key or tampered ciphertext).
    #[error("token decryption failed")]
    Decrypt,

    /// Encryption failed.
    #[error("token encryption failed")]
    Encrypt,

    /// The decrypted token is not UTF-8.
    #[error("decrypted token is not UTF-8")]
    NotUtf8,
}

/// AES-256-GCM cipher for access tokens.
#[derive(Clone)]
pub struct AesCredentials {
    cipher: Aes256Gcm,
}

impl AesCredentials {
    /// Creates a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self, CredentialError> {
        if key.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey);
        }
        Ok(AesCredentials {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        })
    }

    /// Creates a cipher from a hex-encoded key.
    pub fn from_hex(key_hex: &str) -> Result<Self, CredentialError> {
        let key = hex::decode(key_hex.trim()).map_err(|_| CredentialError::InvalidKey)?;
        AesCredentials::new(&key)
    }

    /// Encrypts a plaintext token into its stored form.
    pub fn encrypt(&self, token: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut stored = nonce.to_vec();
        stored.extend_from_slice(&ciphertext);
        Ok(hex::encode(stored))
    }
}

impl CredentialDecryptor for AesCredentials {
    type Error = CredentialError;

    fn decrypt(&self, encrypted_token: &str) -> Result<AccessToken, CredentialError> {
        let data = hex::decode(encrypted_token.trim())?;
        if data.len() < NONCE_LEN {
            return Err(CredentialError::TooShort);
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;

        String::from_utf8(plaintext)
            .map(AccessToken::new)
            .map_err(|_| CredentialError::NotUtf8)
    }
}

impl fmt::Debug for AesCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesCredentials(<key>)")
    }
}

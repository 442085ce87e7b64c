//! Encrypted payload envelope.
//!
//! A sealed package payload is wrapped in a [`SealedEnvelope`] that carries
//! the ciphertext and what the receiver needs to open it.

use serde::{Deserialize, Serialize};

use crate::crypto::{EncryptionKey, EncryptionNonce};
use crate::error::{Result, SealError};

/// Format identifier for sealed payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SealFormat {
    /// ChaCha20-Poly1305 with 256-bit key.
    ChaCha20Poly1305 = 1,
}

/// An encrypted payload envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub format: SealFormat,

    /// Nonce used for encryption (unique per envelope).
    pub nonce: EncryptionNonce,

    /// The encrypted data (includes authentication tag).
    pub ciphertext: Vec<u8>,
}

impl SealedEnvelope {
    /// Encrypt plaintext with the given key.
    pub fn seal(plaintext: &[u8], key: &EncryptionKey) -> Result<Self> {
        let nonce = EncryptionNonce::generate();
        let ciphertext = key.encrypt(plaintext, &nonce)?;
        Ok(Self {
            format: SealFormat::ChaCha20Poly1305,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with the given key.
    pub fn open(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        match self.format {
            SealFormat::ChaCha20Poly1305 => key.decrypt(&self.ciphertext, &self.nonce),
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SealError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| SealError::SerializationError(e.to_string()))
    }
}

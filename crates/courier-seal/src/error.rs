//! Error types for the sealing module.

use courier_core::NodeId;
use thiserror::Error;

/// Errors that can occur while packing or unpacking payloads.
#[derive(Debug, Error)]
pub enum SealError {
    /// Encryption failed.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption failed (wrong key, tampered ciphertext).
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    CompressionError(String),

    /// Envelope serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// No public key is known for the peer.
    #[error("no key for peer {0}")]
    UnknownPeer(NodeId),

    /// Broadcast channel used without a network key.
    #[error("no network key configured for broadcast packages")]
    NoNetworkKey,

    /// A stage hook refused the payload.
    #[error("stage hook failed: {0}")]
    Hook(String),
}

/// Result type for sealing operations.
pub type Result<T> = std::result::Result<T, SealError>;

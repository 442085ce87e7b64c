//! Error types for Courier Core.

use thiserror::Error;

use crate::package::PackageKind;
use crate::types::NodeId;

/// Core errors that can occur while encoding, decoding or naming packages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("invalid node id for package naming: {0:?}")]
    InvalidNodeId(String),

    #[error("bad package magic")]
    BadMagic,

    #[error("unsupported package version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid scalar {value:?} for type {ty}")]
    InvalidScalar { ty: String, value: String },

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Reasons an incoming package is rejected before anything is applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown sender {0} and anonymous packages are not allowed")]
    UnknownSender(NodeId),

    #[error("package addressed to {recipient}, this node is {current}")]
    WrongRecipient { recipient: String, current: NodeId },

    #[error("package originates from this node ({0})")]
    OwnPackage(NodeId),

    #[error("invalid sequence number: expected {expected}, got {got}")]
    InvalidSequence { expected: u64, got: u64 },

    #[error("stale snapshot: sequence {got} not after last loaded snapshot {last}")]
    StaleSnapshot { last: u64, got: u64 },

    #[error("package payload is empty")]
    EmptyPayload,

    #[error("marker {field} does not match file name: marker={marker}, file={file}")]
    MarkerMismatch {
        field: &'static str,
        marker: String,
        file: String,
    },

    #[error("package kind mismatch: expected {expected}, got {got}")]
    KindMismatch { expected: PackageKind, got: PackageKind },

    #[error("payload digest mismatch")]
    DigestMismatch,

    #[error("malformed package: {0}")]
    Malformed(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        ValidationError::Malformed(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

//! Error types for the replication engine.

use thiserror::Error;

use crate::hooks::Collision;
use crate::state::EngineState;

/// Errors that can occur while building, replaying or moving packages.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] courier_store::StoreError),

    /// Encoding or naming failed.
    #[error("core error: {0}")]
    CoreError(#[from] courier_core::CoreError),

    /// Pack/unpack failed.
    #[error("seal error: {0}")]
    SealError(#[from] courier_seal::SealError),

    /// Package validation failed.
    #[error("validation error: {0}")]
    ValidationError(#[from] courier_core::ValidationError),

    /// The collision hook escalated.
    #[error("collision: {0}")]
    Collision(Collision),

    /// A value in a package does not fit the local property.
    #[error("invalid value for {class}.{property}: {reason}")]
    InvalidValue {
        class: String,
        property: String,
        reason: String,
    },

    /// A registered method handler failed.
    #[error("method {class}.{method} failed: {reason}")]
    MethodFailed {
        class: String,
        method: String,
        reason: String,
    },

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Another load or snapshot holds the engine.
    #[error("engine busy: {0:?}")]
    Busy(EngineState),

    /// The local database has no current node.
    #[error("no current node configured")]
    NotInitialized,

    /// Unknown peer.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The class is not part of the schema.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// The object does not exist locally.
    #[error("unknown object: {0}")]
    UnknownObject(courier_core::ObjectKey),

    /// Temp file or folder I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

//! Error types for the replication service.

use courier_core::{CoreError, PackageName};
use courier_seal::SealError;
use courier_store::StoreError;
use courier_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during replicator operations.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// Engine error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Naming or encoding error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Pack/unpack error.
    #[error("seal error: {0}")]
    Seal(#[from] SealError),

    /// Configuration could not be read.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A package is not in the local package store.
    #[error("package not found: {0}")]
    PackageNotFound(PackageName),

    /// A spawned task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(String),
}

/// Result type for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

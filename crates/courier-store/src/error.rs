//! Error types for the store module.

use courier_core::NodeId;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Column blob serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The current node record can never be deleted.
    #[error("refusing to delete the current node {0}")]
    CurrentNodeDeletion(NodeId),

    /// A second node was flagged current.
    #[error("node {new} cannot be current, {existing} already is")]
    DuplicateCurrentNode { existing: NodeId, new: NodeId },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The blocking task running a query did not complete.
    #[error("blocking task failed: {0}")]
    Blocking(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

//! # Courier
//!
//! Store-and-forward replication of a business-object graph between
//! database replicas that are not continuously connected.
//!
//! ## Overview
//!
//! Each node records its mutations as nested change sessions. Courier
//! periodically packages them into addressed, sealed transport units, moves
//! them through a shared transport (a folder, a file share, anything that
//! can list, upload and download files) and replays them on the peers:
//!
//! - **Gap-free**: every sender's packages are applied in exact sequence
//!   order; a gap or duplicate is rejected without side effects
//! - **Idempotent**: a change session is applied at most once per node
//! - **Identity-preserving**: remote objects map to local objects through a
//!   durable identity map, carried across hops by known mappings
//! - **Bootstrappable**: new nodes start from a snapshot and continue with
//!   incremental packages
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier::{Replicator, ReplicatorConfig};
//! use courier::core::{NodeId, Schema};
//! use courier::store::SqliteStore;
//! use courier::sync::{EngineConfig, FolderTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> courier::Result<()> {
//!     let store = Arc::new(SqliteStore::open("node-a.db")?);
//!     let transport = FolderTransport::open("/mnt/share/courier").await?;
//!     let config = ReplicatorConfig::new(EngineConfig::new("Shop"));
//!     let replicator = Replicator::open(store, Schema::new(), transport, config);
//!     replicator.engine().initialize(NodeId::new("A"), "").await?;
//!
//!     let report = replicator.sync_once(&CancellationToken::new(), None).await?;
//!     println!("loaded {} packages", report.batch.loaded.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `courier::core` - Data model, package format and validation
//! - `courier::store` - Storage abstraction, SQLite and in-memory stores
//! - `courier::sync` - The replication engine and transports
//! - `courier::seal` - Compression and encryption of package bytes

pub mod config;
pub mod error;
pub mod replicator;
pub mod task;

// Re-export component crates
pub use courier_core as core;
pub use courier_seal as seal;
pub use courier_store as store;
pub use courier_sync as sync;

// Re-export main types for convenience
pub use config::{BatchPolicy, ReplicatorConfig};
pub use error::{ReplicatorError, Result};
pub use replicator::{BatchReport, ReceiveReport, Replicator, SendReport, SyncReport};
pub use task::TaskHandle;

// Re-export commonly used types
pub use courier_core::{NodeId, ObjectKey, PackageName, Schema};
pub use courier_sync::{Engine, EngineConfig, LoadOutcome, MemoryTransport, Transport};

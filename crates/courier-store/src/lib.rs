//! # Courier Store
//!
//! Storage abstraction for Courier. Provides a trait-based interface over
//! node records, the local object graph, the identity map, the change log and
//! the package store, with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`WriteBatch`] - A set of writes committed atomically
//! - [`IdentityEntry`] - One remote-to-local identity mapping
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::{Node, NodeId};
//! use courier_store::{SqliteStore, Store, StoreExt};
//!
//! async fn example() {
//!     let store = SqliteStore::open("courier.db").unwrap();
//!     store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
//!     let current = store.current_node().await.unwrap();
//!     assert!(current.is_some());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    IdentityEntry, LogEntry, PackageDirection, PackageEvent, Store, StoreExt, StoredPackage,
    WriteBatch,
};

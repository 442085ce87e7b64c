//! # Courier Sync
//!
//! The replication engine: routing, package building, replay and snapshots.
//!
//! ## Overview
//!
//! Each node records its own mutations as nested change sessions. A build
//! routes unsaved sessions to recipients and packs them into one sealed
//! package per recipient. A load validates an incoming package against the
//! sender's gap-free sequence, then replays it into the local object graph,
//! translating remote references through the identity map. Snapshots
//! bootstrap new nodes through the same identity substrate.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_core::{NodeId, Schema};
//! use courier_store::MemoryStore;
//! use courier_sync::{Engine, EngineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> courier_sync::Result<()> {
//!     let engine = Engine::new(Arc::new(MemoryStore::new()), Schema::new(), EngineConfig::new("App"));
//!     engine.initialize(NodeId::new("A"), "").await?;
//!
//!     let report = engine.build(&CancellationToken::new(), None).await?;
//!     for package in report.packages {
//!         println!("built {}", package.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! EditSession ──> change log ──> Router ──> PackageBuilder ──> Transport
//!                                                                 │
//! object graph <── UnitOfWork <── Replayer / SnapshotLoader <─────┘
//!                      │
//!                IdentityResolver
//! ```

pub mod buffer;
pub mod builder;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod progress;
pub mod replay;
pub mod router;
pub mod snapshot;
pub mod state;
pub mod transport;
pub mod uow;

pub use builder::{BuildReport, PackageBuilder};
pub use capture::EditSession;
pub use config::{EngineConfig, RoutingMode};
pub use engine::Engine;
pub use error::{Result, SyncError};
pub use hooks::{
    Collision, CollisionKind, CollisionResolver, DefaultResolver, Hooks, MethodHandler,
    MethodRegistry, RecipientHook, Resolution, SnapshotVeto,
};
pub use identity::IdentityResolver;
pub use progress::{Progress, ProgressTx, Task};
pub use replay::{LoadOutcome, LoadStats, Replayer};
pub use router::{RoutePlan, Router};
pub use snapshot::{SnapshotBuilder, SnapshotLoader};
pub use state::{EngineGate, EngineState, StateGuard};
pub use transport::{folder::FolderTransport, memory::MemoryTransport, FileMask, Transport};
pub use uow::UnitOfWork;

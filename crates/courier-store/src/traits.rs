//! Store trait: the abstract interface for replication state.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::{
    ChangeSession, Node, NodeId, Object, ObjectKey, PackageName, SessionId, TicketEvent,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One durable identity-map entry: the object `remote_id` of `class` on
/// `peer` is the local object `local_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub peer: NodeId,
    pub class: String,
    pub remote_id: String,
    pub local_id: String,
}

impl IdentityEntry {
    /// Mapping of `remote_id` on `peer` to `local_id`.
    pub fn new(peer: NodeId, class: &str, remote_id: &str, local_id: &str) -> Self {
        Self {
            peer,
            class: class.to_string(),
            remote_id: remote_id.to_string(),
            local_id: local_id.to_string(),
        }
    }

    /// Key of the local object this entry points at.
    pub fn local_key(&self) -> ObjectKey {
        ObjectKey::new(self.class.clone(), self.local_id.clone())
    }
}

/// Which way a stored package travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageDirection {
    /// Built here.
    Outgoing,
    /// Downloaded from a transport.
    Incoming,
}

impl PackageDirection {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageDirection::Outgoing => "out",
            PackageDirection::Incoming => "in",
        }
    }

    /// Inverse of [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "out" => Some(PackageDirection::Outgoing),
            "in" => Some(PackageDirection::Incoming),
            _ => None,
        }
    }
}

/// A sealed package held in the local package store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPackage {
    pub name: PackageName,
    pub direction: PackageDirection,
    pub created_at: i64,
    pub bytes: Bytes,
}

/// What happened to a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageEvent {
    Created,
    Sent,
    Imported,
    Loaded,
    Rejected,
    Failed,
    /// A session inside the package had already been replayed.
    SessionAlreadyLoaded,
    /// Protocol package dated before the bootstrap snapshot.
    CoveredBySnapshot,
    /// A ticket about the package arrived from a peer.
    Ticket { from: NodeId, event: TicketEvent },
}

impl PackageEvent {
    /// Short label for log output.
    pub fn label(&self) -> &'static str {
        match self {
            PackageEvent::Created => "created",
            PackageEvent::Sent => "sent",
            PackageEvent::Imported => "imported",
            PackageEvent::Loaded => "loaded",
            PackageEvent::Rejected => "rejected",
            PackageEvent::Failed => "failed",
            PackageEvent::SessionAlreadyLoaded => "session-already-loaded",
            PackageEvent::CoveredBySnapshot => "covered-by-snapshot",
            PackageEvent::Ticket { .. } => "ticket",
        }
    }
}

impl fmt::Display for PackageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageEvent::Ticket { from, event } => write!(f, "ticket {event} from {from}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Timestamped, human-readable log entry attached to a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub package: PackageName,
    pub at: i64,
    pub event: PackageEvent,
    pub message: String,
}

impl LogEntry {
    /// Log entry for `package` at `at`.
    pub fn new(package: PackageName, at: i64, event: PackageEvent, message: impl Into<String>) -> Self {
        Self {
            package,
            at,
            event,
            message: message.into(),
        }
    }
}

/// A set of writes applied atomically by [`Store::commit`].
///
/// Object puts and deletes are expected to be disjoint; a unit of work
/// resolves create-then-delete before it builds the batch. Deleting an
/// object also drops the identity entries pointing at it.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub objects_put: Vec<Object>,
    pub objects_deleted: Vec<ObjectKey>,
    /// Inserted or replaced by (peer, class, remote id).
    pub identities: Vec<IdentityEntry>,
    pub nodes: Vec<Node>,
    /// Appended to the change log; ignored when the id already exists.
    pub sessions: Vec<ChangeSession>,
    pub sessions_saved: Vec<SessionId>,
    pub packages: Vec<StoredPackage>,
    pub log: Vec<LogEntry>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.objects_put.is_empty()
            && self.objects_deleted.is_empty()
            && self.identities.is_empty()
            && self.nodes.is_empty()
            && self.sessions.is_empty()
            && self.sessions_saved.is_empty()
            && self.packages.is_empty()
            && self.log.is_empty()
    }

    /// Add a node write.
    pub fn put_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a log entry.
    pub fn log(mut self, entry: LogEntry) -> Self {
        self.log.push(entry);
        self
    }

    /// Fold `other` into this batch; `other`'s writes land after ours.
    pub fn extend(&mut self, other: WriteBatch) {
        self.objects_put.extend(other.objects_put);
        self.objects_deleted.extend(other.objects_deleted);
        self.identities.extend(other.identities);
        self.nodes.extend(other.nodes);
        self.sessions.extend(other.sessions);
        self.sessions_saved.extend(other.sessions_saved);
        self.packages.extend(other.packages);
        self.log.extend(other.log);
    }
}

/// The Store trait: async interface for replication state.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Single write path**: every mutation goes through [`Store::commit`], so
///   a package replay or a build lands all-or-nothing.
/// - **One current node**: committing a second node flagged current fails.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// The node record flagged current, if the database was initialized.
    async fn current_node(&self) -> Result<Option<Node>>;

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>>;

    /// All node records, ordered by id.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Delete a peer. Fails with `CurrentNodeDeletion` for the current node.
    async fn delete_node(&self, id: &NodeId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Object graph
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>>;

    /// All objects of `class`, ordered by id.
    async fn list_objects(&self, class: &str) -> Result<Vec<Object>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Identity map
    // ─────────────────────────────────────────────────────────────────────────

    async fn lookup_identity(
        &self,
        peer: &NodeId,
        class: &str,
        remote_id: &str,
    ) -> Result<Option<IdentityEntry>>;

    /// Entries pointing at the local object `key`, ordered by peer.
    async fn identities_for(&self, key: &ObjectKey) -> Result<Vec<IdentityEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Change log
    // ─────────────────────────────────────────────────────────────────────────

    /// Sessions not yet packaged, oldest commit first.
    async fn unsaved_sessions(&self) -> Result<Vec<ChangeSession>>;

    async fn has_session(&self, id: &SessionId) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Package store and log
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_package(&self, name: &PackageName) -> Result<Option<StoredPackage>>;

    /// Packages travelling in `direction`, oldest first.
    async fn list_packages(&self, direction: PackageDirection) -> Result<Vec<StoredPackage>>;

    /// Log entries of one package, oldest first.
    async fn package_log(&self, name: &PackageName) -> Result<Vec<LogEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply every write in `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Insert or update a single node record.
    fn put_node(&self, node: Node) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Append a single log entry.
    fn append_log(&self, entry: LogEntry) -> impl std::future::Future<Output = Result<()>> + Send;

    /// The current node, or `NotFound` when the database was never initialized.
    fn require_current(&self) -> impl std::future::Future<Output = Result<Node>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn put_node(&self, node: Node) -> Result<()> {
        self.commit(WriteBatch::new().put_node(node)).await
    }

    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        self.commit(WriteBatch::new().log(entry)).await
    }

    async fn require_current(&self) -> Result<Node> {
        self.current_node()
            .await?
            .ok_or_else(|| crate::error::StoreError::NotFound("current node".into()))
    }
}

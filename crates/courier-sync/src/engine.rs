//! The replication engine.
//!
//! [`Engine`] owns everything a node needs to replicate: the store, the
//! schema, the selector, hooks, the packer and the engine state. Each
//! operation borrows those into a short-lived component ([`PackageBuilder`],
//! [`Replayer`], [`SnapshotBuilder`]) for the duration of one call.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use courier_core::{Node, NodeId, PackageName, Schema, SealedPackage, Selector, SelectorConfig};
use courier_seal::{Packer, PlainPacker};
use courier_store::{Store, StoreExt};

use crate::builder::{BuildReport, PackageBuilder};
use crate::capture::EditSession;
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::hooks::Hooks;
use crate::progress::ProgressTx;
use crate::replay::{LoadOutcome, Replayer};
use crate::router::Router;
use crate::snapshot::SnapshotBuilder;
use crate::state::{EngineGate, EngineState};

/// Replication engine for one node: builds, loads and snapshots.
pub struct Engine<S: Store> {
    store: Arc<S>,
    schema: Arc<Schema>,
    selector: Arc<dyn Selector>,
    hooks: Hooks,
    packer: Arc<dyn Packer>,
    config: EngineConfig,
    gate: EngineGate,
    /// Serializes every operation that rewrites node counters.
    exclusive: Mutex<()>,
}

impl<S: Store> Engine<S> {
    /// Create an engine with an allow-all selector, default hooks and no
    /// packing.
    pub fn new(store: Arc<S>, schema: Schema, config: EngineConfig) -> Self {
        Self {
            store,
            schema: Arc::new(schema),
            selector: Arc::new(SelectorConfig::default()),
            hooks: Hooks::default(),
            packer: Arc::new(PlainPacker),
            config,
            gate: EngineGate::new(),
            exclusive: Mutex::new(()),
        }
    }

    /// Use `selector` for routing and snapshot eligibility.
    pub fn with_selector(mut self, selector: impl Selector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    /// Install application hooks.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Pack and unpack payloads with `packer`.
    pub fn with_packer(mut self, packer: impl Packer + 'static) -> Self {
        self.packer = Arc::new(packer);
        self
    }

    /// Share a state cell with an owning service.
    pub fn with_gate(mut self, gate: EngineGate) -> Self {
        self.gate = gate;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The class metadata.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The payload packer.
    pub fn packer(&self) -> &dyn Packer {
        self.packer.as_ref()
    }

    /// Current gate state.
    pub fn state(&self) -> EngineState {
        self.gate.state()
    }

    /// The gate guarding loads and snapshot builds.
    pub fn gate(&self) -> &EngineGate {
        &self.gate
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Nodes
    // ─────────────────────────────────────────────────────────────────────────

    /// Make sure the database has a current node. Returns the existing one
    /// if it was already initialized.
    pub async fn initialize(&self, id: NodeId, address: &str) -> Result<Node> {
        if let Some(current) = self.store.current_node().await? {
            return Ok(current);
        }
        if !id.is_valid() {
            return Err(SyncError::UnknownNode(id.to_string()));
        }
        let node = Node::current(id, address);
        self.store.put_node(node.clone()).await?;
        info!(node = %node.id, "initialized current node");
        Ok(node)
    }

    /// Add a peer, or update its address.
    pub async fn register_peer(&self, id: NodeId, address: &str) -> Result<Node> {
        if !id.is_valid() {
            return Err(SyncError::UnknownNode(id.to_string()));
        }
        let _lock = self.exclusive.lock().await;
        let node = match self.store.get_node(&id).await? {
            Some(mut existing) => {
                existing.address = address.to_string();
                existing
            }
            None => Node::new(id, address),
        };
        self.store.put_node(node.clone()).await?;
        debug!(node = %node.id, "registered peer");
        Ok(node)
    }

    /// Stop routing to a peer without forgetting its counters.
    pub async fn set_peer_disabled(&self, id: &NodeId, disabled: bool) -> Result<()> {
        let _lock = self.exclusive.lock().await;
        let mut node = self
            .store
            .get_node(id)
            .await?
            .filter(|n| !n.is_current)
            .ok_or_else(|| SyncError::UnknownNode(id.to_string()))?;
        node.disabled = disabled;
        self.store.put_node(node).await?;
        Ok(())
    }

    /// Remove a peer. The store refuses to delete the current node.
    pub async fn remove_peer(&self, id: &NodeId) -> Result<()> {
        let _lock = self.exclusive.lock().await;
        self.store.delete_node(id).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Start capturing local changes.
    pub fn edit(&self) -> EditSession<'_, S> {
        EditSession::new(self.store.as_ref(), &self.schema)
    }

    /// Package every unsaved change session for its recipients.
    ///
    /// Builds wait for a running load or snapshot instead of failing.
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<BuildReport> {
        let _lock = self.exclusive.lock().await;
        let router = Router::new(self.selector.as_ref(), &self.hooks, self.config.routing);
        let builder = PackageBuilder::new(
            self.store.as_ref(),
            &self.config,
            self.packer.as_ref(),
            router,
        );
        builder.build(cancel, progress).await
    }

    /// Validate and replay one package.
    ///
    /// Fails with [`SyncError::Busy`] when another load or snapshot build is
    /// running on this node.
    pub async fn load(
        &self,
        name: &PackageName,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<LoadOutcome> {
        let _guard = self.gate.enter(EngineState::Loading)?;
        let _lock = self.exclusive.lock().await;
        let replayer = Replayer::new(
            self.store.as_ref(),
            &self.schema,
            &self.hooks,
            self.packer.as_ref(),
            &self.config,
        );
        replayer.load(name, bytes, cancel, progress).await
    }

    /// Build a snapshot of everything `recipient` may see.
    pub async fn build_snapshot(
        &self,
        recipient: &NodeId,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<SealedPackage> {
        let _guard = self.gate.enter(EngineState::Snapshotting)?;
        let _lock = self.exclusive.lock().await;
        let builder = SnapshotBuilder::new(
            self.store.as_ref(),
            &self.schema,
            self.selector.as_ref(),
            &self.hooks,
            self.packer.as_ref(),
            &self.config,
        );
        builder.build(recipient, cancel, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ClassInfo, PropertyInfo, Scalar, ScalarType};
    use courier_store::MemoryStore;

    fn engine() -> Engine<MemoryStore> {
        let schema = Schema::new().with_class(
            ClassInfo::new("Invoice").property(PropertyInfo::scalar("Amount", ScalarType::Int)),
        );
        Engine::new(Arc::new(MemoryStore::new()), schema, EngineConfig::new("App"))
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let engine = engine();
        let first = engine.initialize(NodeId::new("A"), "").await.unwrap();
        let second = engine.initialize(NodeId::new("Z"), "").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.is_current);
    }

    #[tokio::test]
    async fn test_load_while_snapshotting_is_busy() {
        let engine = engine();
        engine.initialize(NodeId::new("A"), "").await.unwrap();
        let _held = engine.gate().enter(EngineState::Snapshotting).unwrap();

        let name = PackageName::parse("App-B-AllNodes-00000001-Protocol.pkg").unwrap();
        let err = engine
            .load(&name, vec![1], &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Busy(EngineState::Snapshotting)));
    }

    #[tokio::test]
    async fn test_build_and_load_between_engines() {
        let a = engine();
        let b = engine();
        a.initialize(NodeId::new("A"), "").await.unwrap();
        b.initialize(NodeId::new("B"), "").await.unwrap();
        b.register_peer(NodeId::new("A"), "").await.unwrap();

        let mut edit = a.edit();
        let invoice = edit.create("Invoice").await.unwrap();
        edit.set(&invoice, "Amount", Scalar::Int(100).into())
            .await
            .unwrap();
        edit.commit().await.unwrap();

        let cancel = CancellationToken::new();
        let report = a.build(&cancel, None).await.unwrap();
        assert_eq!(report.packages.len(), 1);
        let package = &report.packages[0];
        assert_eq!(package.name.file_name("pkg"), "App-A-AllNodes-00000001-Protocol.pkg");

        let outcome = b
            .load(&package.name, package.bytes.clone(), &cancel, None)
            .await
            .unwrap();
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(b.store().list_objects("Invoice").await.unwrap().len(), 1);
        assert_eq!(b.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_disable_unknown_peer() {
        let engine = engine();
        engine.initialize(NodeId::new("A"), "").await.unwrap();
        assert!(engine.set_peer_disabled(&NodeId::new("Q"), true).await.is_err());
        assert!(engine.set_peer_disabled(&NodeId::new("A"), true).await.is_err());
    }
}

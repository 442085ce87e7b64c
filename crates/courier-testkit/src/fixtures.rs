//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a small invoicing schema and
//! meshes of in-memory nodes exchanging packages through one shared
//! [`MemoryTransport`].

use std::path::PathBuf;
use std::sync::Arc;

use courier::{Replicator, ReplicatorConfig, SyncReport};
use courier_core::{
    ClassInfo, FieldValue, Node, NodeId, Object, ObjectKey, PropertyInfo, Scalar, ScalarType,
    Schema, SelectorConfig,
};
use courier_store::{MemoryStore, SqliteStore, Store};
use courier_sync::{Engine, EngineConfig, Hooks, MemoryTransport};
use tokio_util::sync::CancellationToken;

/// Application name used by every fixture.
pub const APP: &str = "App";

/// Invoices with a customer reference, an aggregated address, a line
/// collection and a `Post` method; plus `InternalLog`, which tests exclude
/// through selectors.
pub fn invoice_schema() -> Schema {
    Schema::new()
        .with_class(
            ClassInfo::new("Invoice")
                .property(PropertyInfo::scalar("Number", ScalarType::Int))
                .property(PropertyInfo::scalar("Amount", ScalarType::Int))
                .property(PropertyInfo::reference("Customer", "Customer"))
                .property(PropertyInfo::aggregate("Address", "Address"))
                .property(PropertyInfo::collection("Lines", "Line"))
                .natural_key("Number")
                .method("Post", 0),
        )
        .with_class(
            ClassInfo::new("Customer")
                .property(PropertyInfo::scalar("Name", ScalarType::Text))
                .natural_key("Name"),
        )
        .with_class(ClassInfo::new("Address").property(PropertyInfo::scalar("City", ScalarType::Text)))
        .with_class(ClassInfo::new("Line").property(PropertyInfo::scalar("Qty", ScalarType::Int)))
        .with_class(
            ClassInfo::new("InternalLog").property(PropertyInfo::scalar("Message", ScalarType::Text)),
        )
}

/// A fresh temp directory and a database path inside it.
///
/// Keep the directory alive for as long as the database is used.
pub fn temp_db(name: &str) -> std::io::Result<(tempfile::TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join(format!("{name}.db"));
    Ok((dir, path))
}

/// Open a SQLite-backed replicator on `transport`.
pub fn sqlite_replicator(
    path: &std::path::Path,
    transport: MemoryTransport,
    config: ReplicatorConfig,
) -> courier::Result<Replicator<SqliteStore, MemoryTransport>> {
    let store = Arc::new(SqliteStore::open(path)?);
    Ok(Replicator::open(store, invoice_schema(), transport, config))
}

pub type MemoryReplicator = Replicator<MemoryStore, MemoryTransport>;

/// One node of a [`Mesh`].
pub struct TestNode {
    pub id: NodeId,
    pub replicator: MemoryReplicator,
}

impl TestNode {
    pub fn engine(&self) -> &Engine<MemoryStore> {
        self.replicator.engine()
    }

    pub fn store(&self) -> &MemoryStore {
        self.replicator.store()
    }

    /// One full sync round for this node.
    pub async fn sync(&self) -> courier::Result<SyncReport> {
        self.replicator
            .sync_once(&CancellationToken::new(), None)
            .await
    }

    /// Create an invoice in its own change session.
    pub async fn create_invoice(&self, number: i64, amount: i64) -> courier::Result<ObjectKey> {
        let mut edit = self.engine().edit();
        let key = edit.create("Invoice").await?;
        edit.set(&key, "Number", Scalar::Int(number).into()).await?;
        edit.set(&key, "Amount", Scalar::Int(amount).into()).await?;
        edit.commit().await?;
        Ok(key)
    }

    pub async fn set_amount(&self, key: &ObjectKey, amount: i64) -> courier::Result<()> {
        let mut edit = self.engine().edit();
        edit.set(key, "Amount", Scalar::Int(amount).into()).await?;
        edit.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, key: &ObjectKey) -> courier::Result<()> {
        let mut edit = self.engine().edit();
        edit.delete(key).await?;
        edit.commit().await?;
        Ok(())
    }

    /// This node's record of `id`.
    pub async fn node(&self, id: &str) -> courier::Result<Option<Node>> {
        Ok(self.store().get_node(&NodeId::new(id)).await?)
    }

    pub async fn object(&self, key: &ObjectKey) -> courier::Result<Option<Object>> {
        Ok(self.store().get_object(key).await?)
    }

    pub async fn objects(&self, class: &str) -> courier::Result<Vec<Object>> {
        Ok(self.store().list_objects(class).await?)
    }

    pub async fn invoice_by_number(&self, number: i64) -> courier::Result<Option<Object>> {
        let wanted = FieldValue::Scalar(Scalar::Int(number));
        Ok(self
            .objects("Invoice")
            .await?
            .into_iter()
            .find(|o| o.get("Number") == &wanted))
    }

    /// `(Number, Amount)` of every invoice, sorted.
    pub async fn invoice_summary(&self) -> courier::Result<Vec<(i64, i64)>> {
        let int = |o: &Object, p: &str| match o.get(p) {
            FieldValue::Scalar(Scalar::Int(v)) => *v,
            _ => 0,
        };
        let mut rows: Vec<_> = self
            .objects("Invoice")
            .await?
            .iter()
            .map(|o| (int(o, "Number"), int(o, "Amount")))
            .collect();
        rows.sort_unstable();
        Ok(rows)
    }
}

/// Which peers each node knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// Every node knows every other node.
    #[default]
    Full,
    /// Each node knows only its neighbours in declaration order.
    Chain,
}

/// Builder for a [`Mesh`].
pub struct MeshBuilder {
    ids: Vec<NodeId>,
    config: ReplicatorConfig,
    topology: Topology,
    selector: Option<SelectorConfig>,
    hooks: Option<Hooks>,
}

impl MeshBuilder {
    pub fn config(mut self, config: ReplicatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn point_to_point(mut self) -> Self {
        self.config.engine = self.config.engine.point_to_point();
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub async fn build(self) -> courier::Result<Mesh> {
        let transport = MemoryTransport::new();
        let mut nodes = Vec::with_capacity(self.ids.len());

        for (index, id) in self.ids.iter().enumerate() {
            let mut engine = Engine::new(
                Arc::new(MemoryStore::new()),
                invoice_schema(),
                self.config.engine.clone(),
            );
            if let Some(selector) = &self.selector {
                engine = engine.with_selector(selector.clone());
            }
            if let Some(hooks) = &self.hooks {
                engine = engine.with_hooks(hooks.clone());
            }
            engine.initialize(id.clone(), "").await?;

            for (other, peer) in self.ids.iter().enumerate() {
                let linked = match self.topology {
                    Topology::Full => other != index,
                    Topology::Chain => other + 1 == index || index + 1 == other,
                };
                if linked {
                    engine.register_peer(peer.clone(), "").await?;
                }
            }

            let replicator = Replicator::new(engine, transport.clone(), self.config.clone());
            nodes.push(TestNode {
                id: id.clone(),
                replicator,
            });
        }
        Ok(Mesh { transport, nodes })
    }
}

/// Nodes sharing one in-memory transport folder.
pub struct Mesh {
    pub transport: MemoryTransport,
    pub nodes: Vec<TestNode>,
}

impl Mesh {
    pub fn builder(ids: &[&str]) -> MeshBuilder {
        MeshBuilder {
            ids: ids.iter().map(|id| NodeId::new(*id)).collect(),
            config: ReplicatorConfig::new(EngineConfig::new(APP)),
            topology: Topology::Full,
            selector: None,
            hooks: None,
        }
    }

    /// The node named `id`.
    ///
    /// # Panics
    ///
    /// If the mesh has no such node.
    pub fn node(&self, id: &str) -> &TestNode {
        match self.nodes.iter().find(|n| n.id.as_str() == id) {
            Some(node) => node,
            None => panic!("no node {id} in mesh"),
        }
    }

    /// One sync round per node, in declaration order.
    pub async fn round(&self) -> courier::Result<Vec<SyncReport>> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            reports.push(node.sync().await?);
        }
        Ok(reports)
    }

    /// Run rounds until one moves nothing, at most `max` times. Returns the
    /// number of rounds that did something.
    pub async fn settle(&self, max: usize) -> courier::Result<usize> {
        for round in 0..max {
            let quiet = self.round().await?.iter().all(|r| {
                r.sent.uploaded.is_empty()
                    && r.received.imported.is_empty()
                    && r.batch.loaded.is_empty()
                    && r.tickets == 0
            });
            if quiet {
                return Ok(round);
            }
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_schema_aggregates_address() {
        let schema = invoice_schema();
        let created = schema.instantiate(ObjectKey::generate("Invoice"));
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].key.class, "Address");
        assert!(schema.class("Invoice").unwrap().has_method("Post", 0));
    }

    #[tokio::test]
    async fn test_chain_topology_links_neighbours() {
        let mesh = Mesh::builder(&["A", "B", "C"])
            .topology(Topology::Chain)
            .build()
            .await
            .unwrap();
        assert!(mesh.node("A").node("B").await.unwrap().is_some());
        assert!(mesh.node("A").node("C").await.unwrap().is_none());
        assert!(mesh.node("B").node("C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mesh_replicates_invoice() {
        let mesh = Mesh::builder(&["A", "B"]).build().await.unwrap();
        mesh.node("A").create_invoice(7, 100).await.unwrap();
        mesh.settle(4).await.unwrap();
        assert_eq!(mesh.node("B").invoice_summary().await.unwrap(), vec![(7, 100)]);
    }
}

//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use courier_core::{ChangeSession, Node, NodeId, Object, ObjectKey, PackageName, SessionId};

use crate::error::{Result, StoreError};
use crate::traits::{
    IdentityEntry, LogEntry, PackageDirection, Store, StoredPackage, WriteBatch,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default, Clone)]
struct MemoryStoreInner {
    nodes: BTreeMap<NodeId, Node>,
    objects: BTreeMap<ObjectKey, Object>,
    /// (peer, class, remote id) -> entry.
    identities: BTreeMap<(NodeId, String, String), IdentityEntry>,
    /// Change log in insertion order.
    sessions: Vec<ChangeSession>,
    session_ids: HashSet<SessionId>,
    /// Keyed by file name stem.
    packages: HashMap<String, StoredPackage>,
    log: Vec<LogEntry>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Blocking(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Blocking(format!("lock poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn apply(&mut self, batch: WriteBatch) -> Result<()> {
        for node in batch.nodes {
            if node.is_current {
                if let Some(existing) = self
                    .nodes
                    .values()
                    .find(|n| n.is_current && n.id != node.id)
                {
                    return Err(StoreError::DuplicateCurrentNode {
                        existing: existing.id.clone(),
                        new: node.id,
                    });
                }
            }
            self.nodes.insert(node.id.clone(), node);
        }

        for key in batch.objects_deleted {
            self.objects.remove(&key);
            self.identities
                .retain(|_, e| !(e.class == key.class && e.local_id == key.id));
        }

        for object in batch.objects_put {
            self.objects.insert(object.key.clone(), object);
        }

        for entry in batch.identities {
            let key = (entry.peer.clone(), entry.class.clone(), entry.remote_id.clone());
            self.identities.insert(key, entry);
        }

        for session in batch.sessions {
            if self.session_ids.insert(session.id) {
                self.sessions.push(session);
            }
        }

        for id in batch.sessions_saved {
            if let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) {
                session.saved = true;
            }
        }

        for package in batch.packages {
            self.packages.insert(package.name.stem(), package);
        }

        self.log.extend(batch.log);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn current_node(&self) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.values().find(|n| n.is_current).cloned())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read()?.nodes.values().cloned().collect())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<()> {
        let mut inner = self.write()?;
        match inner.nodes.get(id) {
            None => Err(StoreError::NotFound(format!("node {id}"))),
            Some(node) if node.is_current => Err(StoreError::CurrentNodeDeletion(id.clone())),
            Some(_) => {
                inner.nodes.remove(id);
                Ok(())
            }
        }
    }

    async fn get_object(&self, key: &ObjectKey) -> Result<Option<Object>> {
        Ok(self.read()?.objects.get(key).cloned())
    }

    async fn list_objects(&self, class: &str) -> Result<Vec<Object>> {
        Ok(self
            .read()?
            .objects
            .values()
            .filter(|o| o.key.class == class)
            .cloned()
            .collect())
    }

    async fn lookup_identity(
        &self,
        peer: &NodeId,
        class: &str,
        remote_id: &str,
    ) -> Result<Option<IdentityEntry>> {
        let key = (peer.clone(), class.to_string(), remote_id.to_string());
        Ok(self.read()?.identities.get(&key).cloned())
    }

    async fn identities_for(&self, key: &ObjectKey) -> Result<Vec<IdentityEntry>> {
        Ok(self
            .read()?
            .identities
            .values()
            .filter(|e| e.class == key.class && e.local_id == key.id)
            .cloned()
            .collect())
    }

    async fn unsaved_sessions(&self) -> Result<Vec<ChangeSession>> {
        let mut sessions: Vec<ChangeSession> = self
            .read()?
            .sessions
            .iter()
            .filter(|s| !s.saved)
            .cloned()
            .collect();
        // Stable: insertion order breaks ties.
        sessions.sort_by_key(|s| s.committed_at);
        Ok(sessions)
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool> {
        Ok(self.read()?.session_ids.contains(id))
    }

    async fn get_package(&self, name: &PackageName) -> Result<Option<StoredPackage>> {
        Ok(self.read()?.packages.get(&name.stem()).cloned())
    }

    async fn list_packages(&self, direction: PackageDirection) -> Result<Vec<StoredPackage>> {
        let mut packages: Vec<StoredPackage> = self
            .read()?
            .packages
            .values()
            .filter(|p| p.direction == direction)
            .cloned()
            .collect();
        packages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.stem().cmp(&b.name.stem()))
        });
        Ok(packages)
    }

    async fn package_log(&self, name: &PackageName) -> Result<Vec<LogEntry>> {
        Ok(self
            .read()?
            .log
            .iter()
            .filter(|e| &e.package == name)
            .cloned()
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut inner = self.write()?;
        // Apply to a copy so a failing batch leaves nothing behind.
        let mut next = inner.clone();
        next.apply(batch)?;
        *inner = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{PackageEvent, StoreExt};
    use courier_core::{PackageKind, Recipient};

    #[tokio::test]
    async fn test_current_node_rules() {
        let store = MemoryStore::new();
        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
        store.put_node(Node::new(NodeId::new("B"), "")).await.unwrap();

        assert!(matches!(
            store.delete_node(&NodeId::new("A")).await,
            Err(StoreError::CurrentNodeDeletion(_))
        ));
        assert!(matches!(
            store.put_node(Node::current(NodeId::new("B"), "")).await,
            Err(StoreError::DuplicateCurrentNode { .. })
        ));
        store.delete_node(&NodeId::new("B")).await.unwrap();
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_is_atomic() {
        let store = MemoryStore::new();
        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.objects_put.push(Object::new(ObjectKey::new("Invoice", "1")));
        batch.nodes.push(Node::current(NodeId::new("B"), ""));
        assert!(store.commit(batch).await.is_err());
        assert!(store.list_objects("Invoice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_dedup_and_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .sessions
            .push(ChangeSession::new(SessionId::from_u128(1), 20));
        batch
            .sessions
            .push(ChangeSession::new(SessionId::from_u128(2), 10));
        batch
            .sessions
            .push(ChangeSession::new(SessionId::from_u128(1), 5));
        store.commit(batch).await.unwrap();

        let unsaved = store.unsaved_sessions().await.unwrap();
        assert_eq!(unsaved.len(), 2);
        assert_eq!(unsaved[0].id, SessionId::from_u128(2));
        assert_eq!(unsaved[1].committed_at, 20);
    }

    #[tokio::test]
    async fn test_log_filtered_by_package() {
        let store = MemoryStore::new();
        let a = PackageName::new("App", NodeId::new("A"), Recipient::AllNodes, 1, PackageKind::Protocol)
            .unwrap();
        let b = PackageName { seq: 2, ..a.clone() };
        store
            .append_log(LogEntry::new(a.clone(), 1, PackageEvent::Created, ""))
            .await
            .unwrap();
        store
            .append_log(LogEntry::new(b, 2, PackageEvent::Created, ""))
            .await
            .unwrap();
        assert_eq!(store.package_log(&a).await.unwrap().len(), 1);
    }
}

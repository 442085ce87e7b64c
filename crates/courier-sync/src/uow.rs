//! Nested units of work over the local store.
//!
//! A [`UnitOfWork`] buffers object writes, identity placeholders and change
//! log sessions in a stack of layers. Reads see the topmost write first and
//! fall through to the store. Committing a layer folds it into its parent;
//! only the root turns into a [`WriteBatch`], so nothing reaches the store
//! until the whole package has been applied.

use std::collections::{BTreeMap, HashMap, HashSet};

use courier_core::{ChangeSession, NodeId, Object, ObjectKey};
use courier_store::{IdentityEntry, Store, WriteBatch};

use crate::error::Result;

type IdentityKey = (NodeId, String, String);

#[derive(Debug, Default)]
struct Layer {
    /// `None` marks a deletion.
    objects: HashMap<ObjectKey, Option<Object>>,
    created: HashSet<ObjectKey>,
    /// Placeholder identity entries, fixed up when the root is committed.
    identities: HashMap<IdentityKey, ObjectKey>,
    sessions: Vec<ChangeSession>,
}

impl Layer {
    fn absorb(&mut self, child: Layer) {
        self.objects.extend(child.objects);
        self.created.extend(child.created);
        self.identities.extend(child.identities);
        self.sessions.extend(child.sessions);
    }
}

/// Nested, staged writes over a store, committed as one batch.
pub struct UnitOfWork<'s, S: Store + ?Sized> {
    store: &'s S,
    layers: Vec<Layer>,
}

impl<'s, S: Store + ?Sized> UnitOfWork<'s, S> {
    /// Empty unit of work over `store`.
    pub fn new(store: &'s S) -> Self {
        Self {
            store,
            layers: vec![Layer::default()],
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &'s S {
        self.store
    }

    /// Number of open layers, the root included.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Open a nested layer.
    pub fn begin(&mut self) {
        self.layers.push(Layer::default());
    }

    /// Fold the top layer into its parent. The root cannot be committed this
    /// way; use [`UnitOfWork::into_batch`].
    pub fn commit_layer(&mut self) {
        if self.layers.len() < 2 {
            return;
        }
        if let Some(top) = self.layers.pop() {
            if let Some(parent) = self.layers.last_mut() {
                parent.absorb(top);
            }
        }
    }

    /// Drop the top layer's writes.
    pub fn rollback_layer(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        } else {
            self.layers[0] = Layer::default();
        }
    }

    fn top(&mut self) -> &mut Layer {
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Objects
    // ─────────────────────────────────────────────────────────────────────────

    /// Object as seen through the staged writes.
    pub async fn get(&self, key: &ObjectKey) -> Result<Option<Object>> {
        for layer in self.layers.iter().rev() {
            if let Some(pending) = layer.objects.get(key) {
                return Ok(pending.clone());
            }
        }
        Ok(self.store.get_object(key).await?)
    }

    /// Whether `key` exists through the staged writes.
    pub async fn exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All visible objects of `class`, ordered by id.
    pub async fn list(&self, class: &str) -> Result<Vec<Object>> {
        let mut visible: BTreeMap<String, Object> = self
            .store
            .list_objects(class)
            .await?
            .into_iter()
            .map(|o| (o.key.id.clone(), o))
            .collect();
        for layer in &self.layers {
            for (key, pending) in &layer.objects {
                if key.class != class {
                    continue;
                }
                match pending {
                    Some(object) => {
                        visible.insert(key.id.clone(), object.clone());
                    }
                    None => {
                        visible.remove(&key.id);
                    }
                }
            }
        }
        Ok(visible.into_values().collect())
    }

    /// Stage a write of `object`.
    pub fn put(&mut self, object: Object) {
        self.top().objects.insert(object.key.clone(), Some(object));
    }

    /// Put an object that did not exist before this unit of work.
    pub fn create(&mut self, object: Object) {
        let top = self.top();
        top.created.insert(object.key.clone());
        top.objects.insert(object.key.clone(), Some(object));
    }

    /// Stage a delete of `key`.
    pub fn delete(&mut self, key: &ObjectKey) {
        self.top().objects.insert(key.clone(), None);
    }

    /// Whether `key` was created inside this unit of work.
    pub fn is_new(&self, key: &ObjectKey) -> bool {
        self.layers.iter().any(|l| l.created.contains(key))
    }

    /// Whether `key` is pending deletion.
    pub fn deleted(&self, key: &ObjectKey) -> bool {
        for layer in self.layers.iter().rev() {
            if let Some(pending) = layer.objects.get(key) {
                return pending.is_none();
            }
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identity map
    // ─────────────────────────────────────────────────────────────────────────

    /// Local key the object `remote_id` of `class` on `peer` maps to.
    pub async fn lookup_identity(
        &self,
        peer: &NodeId,
        class: &str,
        remote_id: &str,
    ) -> Result<Option<ObjectKey>> {
        let key = (peer.clone(), class.to_string(), remote_id.to_string());
        for layer in self.layers.iter().rev() {
            if let Some(local) = layer.identities.get(&key) {
                return Ok(Some(local.clone()));
            }
        }
        Ok(self
            .store
            .lookup_identity(peer, class, remote_id)
            .await?
            .map(|entry| entry.local_key()))
    }

    /// Record a placeholder mapping. A later registration for the same remote
    /// object replaces it.
    pub fn register_identity(&mut self, peer: &NodeId, class: &str, remote_id: &str, local: ObjectKey) {
        self.top()
            .identities
            .insert((peer.clone(), class.to_string(), remote_id.to_string()), local);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change log
    // ─────────────────────────────────────────────────────────────────────────

    /// Stage a change session for the local log.
    pub fn record_session(&mut self, session: ChangeSession) {
        self.top().sessions.push(session);
    }

    /// Change sessions staged so far.
    pub fn sessions(&self) -> impl Iterator<Item = &ChangeSession> {
        self.layers.iter().flat_map(|l| l.sessions.iter())
    }

    /// Collapse every layer and produce the batch for [`Store::commit`].
    ///
    /// Objects created and deleted inside the unit of work never reach the
    /// store, and placeholder identities pointing at deleted objects are
    /// dropped.
    pub fn into_batch(mut self) -> WriteBatch {
        while self.layers.len() > 1 {
            self.commit_layer();
        }
        let deleted: HashSet<ObjectKey> = self.layers[0]
            .objects
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.clone())
            .collect();
        let Some(root) = self.layers.pop() else {
            return WriteBatch::new();
        };

        let mut batch = WriteBatch::new();
        let mut objects: Vec<(ObjectKey, Option<Object>)> = root.objects.into_iter().collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, pending) in objects {
            match pending {
                Some(object) => batch.objects_put.push(object),
                None if root.created.contains(&key) => {}
                None => batch.objects_deleted.push(key),
            }
        }

        let mut identities: Vec<(IdentityKey, ObjectKey)> = root
            .identities
            .into_iter()
            .filter(|(_, local)| !deleted.contains(local))
            .collect();
        identities.sort();
        batch.identities = identities
            .into_iter()
            .map(|((peer, class, remote_id), local)| {
                IdentityEntry::new(peer, &class, &remote_id, &local.id)
            })
            .collect();

        batch.sessions = root.sessions;
        batch
    }
}

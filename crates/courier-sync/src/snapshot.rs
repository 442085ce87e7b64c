//! Snapshots: a point-in-time clone of the eligible object graph for one
//! recipient, and the loader that merges it into a node's graph.
//!
//! Cloned objects live in an arena addressed by `u32` handles, so cycles in
//! the graph are plain handle references. Each clone gets an identity record
//! whose ordinal fixes the load order.

use std::collections::{HashMap, HashSet, VecDeque};

use courier_core::canonical::write_package;
use courier_core::{
    now_millis, Entry, FieldValue, KnownMapping, Marker, NodeId, Object, ObjectKey, PackageKind,
    PackageName, PackagedRef, Recipient, Schema, SealedPackage, Selector, SessionId,
    SnapshotField, SnapshotIdentity, SnapshotObject, PACKAGE_VERSION,
};
use courier_seal::{Channel, Packer};
use courier_store::{
    LogEntry, PackageDirection, PackageEvent, Store, StoredPackage, WriteBatch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer::SpillBuffer;
use crate::builder::MappingCache;
use crate::config::{EngineConfig, RoutingMode};
use crate::error::{Result, SyncError};
use crate::hooks::{Collision, CollisionKind, Hooks, Resolution};
use crate::identity::IdentityResolver;
use crate::progress::{emit, ProgressTx, Task};
use crate::replay::LoadStats;
use crate::uow::UnitOfWork;

// ─────────────────────────────────────────────────────────────────────────────
// Building
// ─────────────────────────────────────────────────────────────────────────────

/// Arena of cloned objects.
#[derive(Default)]
struct Arena {
    handles: HashMap<ObjectKey, u32>,
    order: Vec<ObjectKey>,
}

impl Arena {
    fn insert(&mut self, key: &ObjectKey) -> bool {
        if self.handles.contains_key(key) {
            return false;
        }
        let handle = self.order.len() as u32;
        self.handles.insert(key.clone(), handle);
        self.order.push(key.clone());
        true
    }

    fn clone_field(&self, value: &FieldValue) -> SnapshotField {
        match value {
            FieldValue::Null => SnapshotField::Null,
            FieldValue::Scalar(s) => SnapshotField::Scalar(s.clone()),
            // References to objects outside the snapshot are cleared.
            FieldValue::Ref(key) => self
                .handles
                .get(key)
                .map_or(SnapshotField::Null, |h| SnapshotField::Ref(*h)),
            FieldValue::Collection(members) => SnapshotField::Collection(
                members.iter().filter_map(|k| self.handles.get(k).copied()).collect(),
            ),
        }
    }
}

/// Clones the eligible object graph into a snapshot package.
pub struct SnapshotBuilder<'a, S: Store + ?Sized> {
    store: &'a S,
    schema: &'a Schema,
    selector: &'a dyn Selector,
    hooks: &'a Hooks,
    packer: &'a dyn Packer,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> SnapshotBuilder<'a, S> {
    /// Snapshot builder over `store`.
    pub fn new(
        store: &'a S,
        schema: &'a Schema,
        selector: &'a dyn Selector,
        hooks: &'a Hooks,
        packer: &'a dyn Packer,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            schema,
            selector,
            hooks,
            packer,
            config,
        }
    }

    /// Clone the graph `recipient` is allowed to see into a sealed snapshot
    /// and advance the recipient's counters.
    pub async fn build(
        &self,
        recipient: &NodeId,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<SealedPackage> {
        let current = self
            .store
            .current_node()
            .await?
            .ok_or(SyncError::NotInitialized)?;
        if recipient == &current.id {
            return Err(SyncError::UnknownNode(format!(
                "{recipient} is the current node"
            )));
        }
        let mut target = self
            .store
            .get_node(recipient)
            .await?
            .ok_or_else(|| SyncError::UnknownNode(recipient.to_string()))?;

        // Phase 1: Eligible objects, classes in name order
        let mut eligible: HashMap<ObjectKey, Object> = HashMap::new();
        let mut roots: Vec<ObjectKey> = Vec::new();
        for class in self.schema.classes().filter(|c| !c.snapshot_excluded) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let objects = self.store.list_objects(&class.name).await?;
            let allowed: HashSet<ObjectKey> = self
                .selector
                .filter_objects(&class.name, recipient, objects.iter().collect())
                .into_iter()
                .filter(|o| self.hooks.snapshot_allows(o, recipient))
                .map(|o| o.key.clone())
                .collect();
            for object in objects {
                if allowed.contains(&object.key) {
                    roots.push(object.key.clone());
                    eligible.insert(object.key.clone(), object);
                }
            }
        }

        // Phase 2: Breadth-first clone
        let mut arena = Arena::default();
        let mut queue = VecDeque::new();
        for root in &roots {
            if !arena.insert(root) {
                continue;
            }
            queue.push_back(root.clone());
            while let Some(key) = queue.pop_front() {
                let Some(object) = eligible.get(&key) else {
                    continue;
                };
                for value in object.fields.values() {
                    let referenced: Vec<&ObjectKey> = match value {
                        FieldValue::Ref(k) => vec![k],
                        FieldValue::Collection(members) => members.iter().collect(),
                        _ => Vec::new(),
                    };
                    for k in referenced {
                        if eligible.contains_key(k) && arena.insert(k) {
                            queue.push_back(k.clone());
                        }
                    }
                }
            }
        }
        debug!(%recipient, objects = arena.order.len(), "snapshot graph cloned");

        // Phase 3: Entries
        let mut entries = SpillBuffer::new(self.config.spill_threshold);
        let total = arena.order.len();
        for (handle, key) in arena.order.iter().enumerate() {
            let Some(object) = eligible.get(key) else {
                continue;
            };
            let fields = object
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), arena.clone_field(value)))
                .collect();
            entries.push(&Entry::Object(SnapshotObject {
                handle: handle as u32,
                class: key.class.clone(),
                fields,
            }))?;
        }
        let mut mappings = MappingCache::default();
        for (ordinal, key) in arena.order.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let class = self.schema.class(&key.class);
            let mut known_mapping = vec![KnownMapping {
                node: current.id.clone(),
                object_id: key.id.clone(),
            }];
            known_mapping.extend(mappings.known_mapping(self.store, key).await?);
            let reference = PackagedRef {
                assembly: class.map(|c| c.assembly.clone()).unwrap_or_default(),
                class: key.class.clone(),
                id: key.id.clone(),
                replication_key: class
                    .zip(eligible.get(key))
                    .and_then(|(c, o)| c.natural_key_of(o)),
                known_mapping,
            };
            entries.push(&Entry::Identity(SnapshotIdentity {
                ordinal: ordinal as u64,
                handle: ordinal as u32,
                reference,
            }))?;
            emit(progress, Task::Snapshot, ordinal + 1, total, "cloning objects");
        }

        // Phase 4: Seal, advance counters, commit
        let seq = target.next_saved_seq();
        let resume_seq = match self.config.routing {
            RoutingMode::PointToPoint => seq,
            RoutingMode::Broadcast => current.last_saved_seq,
        };
        let now = now_millis();
        let name = PackageName::new(
            self.config.application.clone(),
            current.id.clone(),
            Recipient::Node(recipient.clone()),
            seq,
            PackageKind::Snapshot,
        )?;
        let marker = Marker {
            version: PACKAGE_VERSION,
            application: name.application.clone(),
            sender: current.id.clone(),
            recipient: name.recipient.clone(),
            seq,
            kind: PackageKind::Snapshot,
            created_at: now,
            resume_seq: Some(resume_seq),
            entry_count: entries.entry_count(),
            digest: entries.digest(),
        };
        let entries = entries.into_bytes()?;
        let mut bytes = Vec::with_capacity(entries.len() + 256);
        write_package(&mut bytes, &marker, &entries)?;
        let packed = self
            .packer
            .pack(bytes, &Channel::Peer(recipient.clone()))?;

        target.last_saved_seq = seq;
        target.last_saved_snapshot_seq = seq;
        target.snapshot_watermark = Some(now);
        let mut batch = WriteBatch::new().put_node(target).log(LogEntry::new(
            name.clone(),
            now,
            PackageEvent::Created,
            format!("snapshot of {total} objects"),
        ));
        batch.packages.push(StoredPackage {
            name: name.clone(),
            direction: PackageDirection::Outgoing,
            created_at: now,
            bytes: packed.clone().into(),
        });
        self.store.commit(batch).await?;

        info!(package = %name, objects = total, resume_seq, "snapshot built");
        Ok(SealedPackage {
            name,
            created_at: now,
            bytes: packed,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Restores a snapshot into a unit of work.
pub struct SnapshotLoader<'r> {
    schema: &'r Schema,
    hooks: &'r Hooks,
    resolver: IdentityResolver<'r>,
    sender: &'r NodeId,
}

impl<'r> SnapshotLoader<'r> {
    /// Loader for a snapshot `sender` built for `current`.
    pub fn new(
        schema: &'r Schema,
        hooks: &'r Hooks,
        current: &'r NodeId,
        sender: &'r NodeId,
    ) -> Self {
        Self {
            schema,
            hooks,
            resolver: IdentityResolver::new(schema, current),
            sender,
        }
    }

    fn collide(&self, collision: Collision) -> Result<Resolution> {
        match self.hooks.collisions.resolve(&collision) {
            Resolution::Error => Err(SyncError::Collision(collision)),
            other => Ok(other),
        }
    }

    /// Merge a snapshot into `uow`. Returns the batch to commit.
    pub async fn load<S: Store + ?Sized>(
        &self,
        mut uow: UnitOfWork<'_, S>,
        objects: Vec<SnapshotObject>,
        mut identities: Vec<SnapshotIdentity>,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<(WriteBatch, LoadStats, Vec<SessionId>)> {
        identities.sort_by_key(|i| i.ordinal);
        let objects: HashMap<u32, SnapshotObject> =
            objects.into_iter().map(|o| (o.handle, o)).collect();
        let references: HashMap<u32, &PackagedRef> =
            identities.iter().map(|i| (i.handle, &i.reference)).collect();
        let total = identities.len();

        // Pass 1: resolve or create every identity, in ordinal order
        let mut locals: HashMap<u32, ObjectKey> = HashMap::new();
        for identity in &identities {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let reference = &identity.reference;
            if self.schema.class(&reference.class).is_none() {
                self.collide(
                    Collision::new(CollisionKind::ObjectNotFound, &reference.class)
                        .object(&reference.id),
                )?;
                continue;
            }
            let local = match self
                .resolver
                .resolve(&mut uow, reference, self.sender)
                .await?
            {
                Some(local) => local,
                None => {
                    let key = ObjectKey::generate(reference.class.clone());
                    for object in self.schema.instantiate(key.clone()) {
                        uow.create(object);
                    }
                    key
                }
            };
            self.resolver.register(&mut uow, reference, self.sender, &local);
            locals.insert(identity.handle, local);
        }

        // Pass 2: copy state, following aggregates into existing slots
        let mut copied: HashSet<(u32, ObjectKey)> = HashSet::new();
        for (done, identity) in identities.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let Some(local) = locals.get(&identity.handle).cloned() else {
                continue;
            };
            let mut work = vec![(identity.handle, local)];
            while let Some((handle, key)) = work.pop() {
                if !copied.insert((handle, key.clone())) {
                    continue;
                }
                let Some(source) = objects.get(&handle) else {
                    continue;
                };
                let Some(mut target) = uow.get(&key).await? else {
                    continue;
                };
                self.copy(&mut uow, source, &mut target, &mut locals, &references, &mut work)?;
                uow.put(target);
            }
            emit(progress, Task::Load, done + 1, total, "loading snapshot");
        }

        let stats = LoadStats {
            objects_loaded: locals.len(),
            ..LoadStats::default()
        };
        Ok((uow.into_batch(), stats, Vec::new()))
    }

    /// Copy the fields of `source` onto `target`.
    fn copy<S: Store + ?Sized>(
        &self,
        uow: &mut UnitOfWork<'_, S>,
        source: &SnapshotObject,
        target: &mut Object,
        locals: &mut HashMap<u32, ObjectKey>,
        references: &HashMap<u32, &PackagedRef>,
        work: &mut Vec<(u32, ObjectKey)>,
    ) -> Result<()> {
        let Some(class) = self.schema.class(&source.class) else {
            return Ok(());
        };
        for (name, field) in &source.fields {
            let Some(property) = class.find_property(name) else {
                self.collide(
                    Collision::new(CollisionKind::UnknownProperty, &class.name).member(name),
                )?;
                continue;
            };
            if property.read_only {
                self.collide(
                    Collision::new(CollisionKind::ReadOnlyProperty, &class.name).member(name),
                )?;
                continue;
            }
            let value = match field {
                SnapshotField::Null => FieldValue::Null,
                SnapshotField::Scalar(s) => FieldValue::Scalar(s.clone()),
                SnapshotField::Ref(handle) => {
                    let existing = target.get(name).as_ref_key().cloned();
                    match existing {
                        Some(existing) if property.is_aggregated() => {
                            if locals.get(handle) != Some(&existing) {
                                if let Some(duplicate) = locals.get(handle) {
                                    if uow.is_new(duplicate) {
                                        debug!(%duplicate, %existing, "dropping duplicate aggregate");
                                        uow.delete(duplicate);
                                    }
                                }
                                if let Some(reference) = references.get(handle) {
                                    self.resolver.register(uow, reference, self.sender, &existing);
                                }
                                locals.insert(*handle, existing.clone());
                            }
                            work.push((*handle, existing));
                            continue;
                        }
                        _ => locals
                            .get(handle)
                            .map_or(FieldValue::Null, |k| FieldValue::Ref(k.clone())),
                    }
                }
                SnapshotField::Collection(handles) => FieldValue::Collection(
                    handles.iter().filter_map(|h| locals.get(h).cloned()).collect(),
                ),
            };
            target.set(name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ClassInfo, PropertyInfo, Scalar, ScalarType};
    use courier_store::MemoryStore;

    fn schema() -> Schema {
        Schema::new()
            .with_class(
                ClassInfo::new("Invoice")
                    .property(PropertyInfo::scalar("Number", ScalarType::Int))
                    .property(PropertyInfo::aggregate("Address", "Address")),
            )
            .with_class(
                ClassInfo::new("Address").property(PropertyInfo::scalar("City", ScalarType::Text)),
            )
    }

    fn identity(ordinal: u64, class: &str, id: &str) -> SnapshotIdentity {
        let mut reference = PackagedRef::new(class, id);
        reference.known_mapping.push(KnownMapping {
            node: NodeId::new("A"),
            object_id: id.to_string(),
        });
        SnapshotIdentity {
            ordinal,
            handle: ordinal as u32,
            reference,
        }
    }

    fn invoice_snapshot() -> Vec<SnapshotObject> {
        vec![
            SnapshotObject {
                handle: 0,
                class: "Invoice".into(),
                fields: vec![
                    ("Number".into(), SnapshotField::Scalar(Scalar::Int(1))),
                    ("Address".into(), SnapshotField::Ref(1)),
                ],
            },
            SnapshotObject {
                handle: 1,
                class: "Address".into(),
                fields: vec![("City".into(), SnapshotField::Scalar(Scalar::Text("Oslo".into())))],
            },
        ]
    }

    #[test]
    fn test_arena_clears_references_outside_snapshot() {
        let mut arena = Arena::default();
        let inside = ObjectKey::new("Address", "a1");
        assert!(arena.insert(&inside));
        assert!(!arena.insert(&inside));

        let outside = ObjectKey::new("Address", "a2");
        assert_eq!(arena.clone_field(&FieldValue::Ref(inside.clone())), SnapshotField::Ref(0));
        assert_eq!(arena.clone_field(&FieldValue::Ref(outside.clone())), SnapshotField::Null);
        assert_eq!(
            arena.clone_field(&FieldValue::Collection(vec![outside, inside])),
            SnapshotField::Collection(vec![0])
        );
    }

    #[tokio::test]
    async fn test_loader_redirects_aggregate_into_existing_slot() {
        let store = MemoryStore::new();
        let schema = schema();
        let hooks = Hooks::default();
        let (a, b) = (NodeId::new("A"), NodeId::new("B"));

        let loader = SnapshotLoader::new(&schema, &hooks, &b, &a);
        let (batch, stats, _) = loader
            .load(
                UnitOfWork::new(&store),
                invoice_snapshot(),
                vec![identity(0, "Invoice", "i1"), identity(1, "Address", "a1")],
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        store.commit(batch).await.unwrap();
        assert_eq!(stats.objects_loaded, 2);

        let addresses = store.list_objects("Address").await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(
            addresses[0].get("City"),
            &FieldValue::Scalar(Scalar::Text("Oslo".into()))
        );
        let invoices = store.list_objects("Invoice").await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(
            invoices[0].get("Address"),
            &FieldValue::Ref(addresses[0].key.clone())
        );
        let mapped = store.lookup_identity(&a, "Address", "a1").await.unwrap().unwrap();
        assert_eq!(mapped.local_key(), addresses[0].key);
    }

    #[tokio::test]
    async fn test_loader_reuses_known_objects() {
        let store = MemoryStore::new();
        let schema = schema();
        let hooks = Hooks::default();
        let (a, b) = (NodeId::new("A"), NodeId::new("B"));
        let identities = || vec![identity(0, "Invoice", "i1"), identity(1, "Address", "a1")];

        for _ in 0..2 {
            let loader = SnapshotLoader::new(&schema, &hooks, &b, &a);
            let (batch, _, _) = loader
                .load(
                    UnitOfWork::new(&store),
                    invoice_snapshot(),
                    identities(),
                    &CancellationToken::new(),
                    None,
                )
                .await
                .unwrap();
            store.commit(batch).await.unwrap();
        }
        assert_eq!(store.list_objects("Invoice").await.unwrap().len(), 1);
        assert_eq!(store.list_objects("Address").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_loader_unknown_class_escalates_on_error() {
        let store = MemoryStore::new();
        let schema = schema();
        let hooks = Hooks::default().with_collision_resolver(|_: &Collision| Resolution::Error);
        let (a, b) = (NodeId::new("A"), NodeId::new("B"));

        let loader = SnapshotLoader::new(&schema, &hooks, &b, &a);
        let err = loader
            .load(
                UnitOfWork::new(&store),
                Vec::new(),
                vec![identity(0, "Ledger", "l1")],
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Collision(_)));
    }
}

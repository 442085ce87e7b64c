//! Replay of incoming packages.
//!
//! Every package goes through the same front: addressing, unpack, decode
//! with digest check, marker agreement and sequencing. Protocol packages are
//! then replayed session by session into a [`UnitOfWork`]; snapshots are
//! handed to the [`SnapshotLoader`]. The result lands in the store in one
//! commit together with the sender's counters and the package log, or not
//! at all.

use std::collections::{HashMap, HashSet};

use courier_core::{
    check_sequence, decode_package, now_millis, validate_addressing, validate_marker, ChangeKind,
    ChangeRecord, ChangeSession, ChangeValue, ClassInfo, FieldValue, Node, NodeId, ObjectKey,
    ObjectRef, PackageBody, PackageKind, PackageName, PackagedRecord, PackagedRef,
    PackagedSession, PackagedValue, PropertyInfo, PropertyKind, Recipient, Scalar, ScalarType,
    Schema, SequenceCheck, SessionId, ValidationError,
};
use courier_seal::{Channel, Packer};
use courier_store::{LogEntry, PackageEvent, Store, WriteBatch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::hooks::{Collision, CollisionKind, Hooks, Resolution};
use crate::identity::IdentityResolver;
use crate::progress::{emit, ProgressTx, Task};
use crate::snapshot::SnapshotLoader;
use crate::uow::UnitOfWork;

/// Result of loading one package.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(LoadStats),
    /// Protocol package older than the bootstrap snapshot; nothing applied.
    CoveredBySnapshot,
    /// Failed validation; nothing applied.
    Rejected(ValidationError),
    /// Failed while applying; rolled back.
    Failed(String),
}

impl LoadOutcome {
    /// Loaded or harmlessly skipped.
    pub fn is_success(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_) | LoadOutcome::CoveredBySnapshot)
    }
}

/// Counters for a successful load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub sessions_applied: usize,
    pub sessions_skipped: usize,
    pub records_applied: usize,
    pub records_skipped: usize,
    /// Snapshots only.
    pub objects_loaded: usize,
}

/// Validates and applies incoming packages.
pub struct Replayer<'a, S: Store + ?Sized> {
    store: &'a S,
    schema: &'a Schema,
    hooks: &'a Hooks,
    packer: &'a dyn Packer,
    config: &'a EngineConfig,
}

impl<'a, S: Store + ?Sized> Replayer<'a, S> {
    /// Replayer over `store`, unpacking with `packer`.
    pub fn new(
        store: &'a S,
        schema: &'a Schema,
        hooks: &'a Hooks,
        packer: &'a dyn Packer,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            schema,
            hooks,
            packer,
            config,
        }
    }

    /// Validate and apply one package named `name`.
    ///
    /// Validation and apply failures are reported in the outcome and logged
    /// against the package. `Err` is reserved for store failures and
    /// cancellation.
    pub async fn load(
        &self,
        name: &PackageName,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<LoadOutcome> {
        let current = self
            .store
            .current_node()
            .await?
            .ok_or(SyncError::NotInitialized)?;
        let known_sender = self.store.get_node(&name.sender).await?;

        // 1. Addressing
        if let Err(e) = validate_addressing(
            name,
            &current.id,
            known_sender.is_some(),
            self.config.allow_anonymous_packages,
            &bytes,
        ) {
            return self.reject(name, e).await;
        }

        // 2. Unpack
        let channel = match &name.recipient {
            Recipient::AllNodes => Channel::Broadcast,
            Recipient::Node(_) => Channel::Peer(name.sender.clone()),
        };
        let plain = match self.packer.unpack(bytes, &channel) {
            Ok(plain) => plain,
            Err(e) => return self.reject(name, ValidationError::Malformed(e.to_string())).await,
        };

        // 3. Decode, verifying the digest
        let package = match decode_package(&plain) {
            Ok(package) => package,
            Err(e) => return self.reject(name, e).await,
        };

        // 4. Marker agrees with the file name
        if let Err(e) = validate_marker(name, &package.marker) {
            return self.reject(name, e).await;
        }

        // 5. Sequencing
        let mut sender = known_sender.unwrap_or_else(|| Node::new(name.sender.clone(), ""));
        let marker = package.marker;
        match check_sequence(&marker, &sender) {
            Err(e) => return self.reject(name, e).await,
            Ok(SequenceCheck::CoveredBySnapshot) => {
                sender.last_loaded_seq = sender.last_loaded_seq.max(marker.seq);
                let batch = WriteBatch::new().put_node(sender).log(LogEntry::new(
                    name.clone(),
                    now_millis(),
                    PackageEvent::CoveredBySnapshot,
                    "package predates the bootstrap snapshot",
                ));
                self.store.commit(batch).await?;
                info!(package = %name, "covered by snapshot");
                return Ok(LoadOutcome::CoveredBySnapshot);
            }
            Ok(SequenceCheck::Apply) => {}
        }

        // 6. Apply
        let applied = match package.body {
            PackageBody::Protocol { sessions } => {
                self.replay_protocol(&current.id, &sender.id, sessions, cancel, progress)
                    .await
            }
            PackageBody::Snapshot {
                objects,
                identities,
            } => {
                SnapshotLoader::new(self.schema, self.hooks, &current.id, &sender.id)
                    .load(UnitOfWork::new(self.store), objects, identities, cancel, progress)
                    .await
            }
        };
        let (mut batch, stats, skipped) = match applied {
            Ok(applied) => applied,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => return self.fail(name, e).await,
        };

        // 7. Counters and log, committed with the data
        let now = now_millis();
        match marker.kind {
            PackageKind::Protocol => sender.last_loaded_seq = marker.seq,
            PackageKind::Snapshot => {
                sender.last_loaded_seq = marker.resume_seq.unwrap_or(marker.seq);
                sender.last_loaded_snapshot_seq = marker.seq;
                sender.bootstrap_watermark = Some(marker.created_at);
            }
        }
        batch.nodes.push(sender);
        for id in &skipped {
            batch.log.push(LogEntry::new(
                name.clone(),
                now,
                PackageEvent::SessionAlreadyLoaded,
                format!("session {id} already loaded"),
            ));
        }
        batch.log.push(LogEntry::new(
            name.clone(),
            now,
            PackageEvent::Loaded,
            format!(
                "{} sessions, {} records, {} objects",
                stats.sessions_applied, stats.records_applied, stats.objects_loaded
            ),
        ));
        self.store.commit(batch).await?;

        info!(
            package = %name,
            sessions = stats.sessions_applied,
            records = stats.records_applied,
            objects = stats.objects_loaded,
            "package loaded"
        );
        Ok(LoadOutcome::Loaded(stats))
    }

    async fn reject(&self, name: &PackageName, error: ValidationError) -> Result<LoadOutcome> {
        warn!(package = %name, %error, "package rejected");
        self.store
            .commit(WriteBatch::new().log(LogEntry::new(
                name.clone(),
                now_millis(),
                PackageEvent::Rejected,
                error.to_string(),
            )))
            .await?;
        Ok(LoadOutcome::Rejected(error))
    }

    async fn fail(&self, name: &PackageName, error: SyncError) -> Result<LoadOutcome> {
        warn!(package = %name, %error, "package failed, rolled back");
        let message = error.to_string();
        self.store
            .commit(WriteBatch::new().log(LogEntry::new(
                name.clone(),
                now_millis(),
                PackageEvent::Failed,
                message.clone(),
            )))
            .await?;
        Ok(LoadOutcome::Failed(message))
    }

    async fn replay_protocol(
        &self,
        current: &NodeId,
        sender: &NodeId,
        sessions: Vec<PackagedSession>,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<(WriteBatch, LoadStats, Vec<SessionId>)> {
        let mut replay = ProtocolReplay {
            resolver: IdentityResolver::new(self.schema, current),
            schema: self.schema,
            hooks: self.hooks,
            uow: UnitOfWork::new(self.store),
            sender,
            current,
            forward: self.config.forward_replayed_sessions,
            stats: LoadStats::default(),
        };
        let skipped = replay.run(sessions, cancel, progress).await?;
        let stats = replay.stats;
        Ok((replay.uow.into_batch(), stats, skipped))
    }
}

enum Step {
    Enter(usize),
    Exit(usize),
}

struct ProtocolReplay<'r, 's, S: Store + ?Sized> {
    resolver: IdentityResolver<'r>,
    schema: &'r Schema,
    hooks: &'r Hooks,
    uow: UnitOfWork<'s, S>,
    sender: &'r NodeId,
    current: &'r NodeId,
    forward: bool,
    stats: LoadStats,
}

impl<'r, 's, S: Store + ?Sized> ProtocolReplay<'r, 's, S> {
    /// Depth-first over the session tree, siblings by commit time. Returns
    /// the sessions skipped because they were already loaded.
    async fn run(
        &mut self,
        sessions: Vec<PackagedSession>,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<Vec<SessionId>> {
        let index: HashMap<SessionId, usize> = sessions
            .iter()
            .enumerate()
            .map(|(i, s)| (s.header.id, i))
            .collect();
        let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut roots = Vec::new();
        for (i, session) in sessions.iter().enumerate() {
            match session.header.parent.and_then(|p| index.get(&p)) {
                Some(&parent) if parent != i => children.entry(parent).or_default().push(i),
                _ => roots.push(i),
            }
        }
        let by_commit = |v: &mut Vec<usize>| v.sort_by_key(|&i| sessions[i].header.committed_at);
        by_commit(&mut roots);
        for kids in children.values_mut() {
            by_commit(kids);
        }

        let total = roots.len();
        let mut done = 0;
        let mut skipped = Vec::new();
        let mut seen: HashSet<SessionId> = HashSet::new();
        let mut translated: HashMap<usize, Vec<ChangeRecord>> = HashMap::new();
        let mut stack: Vec<Step> = roots.iter().rev().map(|&i| Step::Enter(i)).collect();

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(i) => {
                    if cancel.is_cancelled() {
                        return Err(SyncError::Cancelled);
                    }
                    let header = &sessions[i].header;
                    if !seen.insert(header.id) || self.uow.store().has_session(&header.id).await? {
                        debug!(session = %header.id, "session already loaded");
                        skipped.push(header.id);
                        self.stats.sessions_skipped += 1;
                        continue;
                    }

                    self.uow.begin();
                    let mut records: Vec<&PackagedRecord> = sessions[i].records.iter().collect();
                    records.sort_by_key(|r| r.modified_at);
                    let mut applied = Vec::with_capacity(records.len());
                    for record in records {
                        match self.apply(record).await? {
                            Some(local) => {
                                if local.is_real() {
                                    self.stats.records_applied += 1;
                                }
                                applied.push(local);
                            }
                            None => self.stats.records_skipped += 1,
                        }
                    }
                    translated.insert(i, applied);

                    stack.push(Step::Exit(i));
                    if let Some(kids) = children.get(&i) {
                        stack.extend(kids.iter().rev().map(|&k| Step::Enter(k)));
                    }
                }
                Step::Exit(i) => {
                    let header = &sessions[i].header;
                    let mut route = header.route.clone();
                    route.push(self.sender.clone());
                    route.push(self.current.clone());
                    self.uow.record_session(ChangeSession {
                        id: header.id,
                        parent: header.parent,
                        committed_at: header.committed_at,
                        route,
                        saved: !self.forward,
                        records: translated.remove(&i).unwrap_or_default(),
                    });
                    self.uow.commit_layer();
                    self.stats.sessions_applied += 1;

                    if header.parent.and_then(|p| index.get(&p)).is_none() {
                        done += 1;
                        emit(progress, Task::Load, done, total, "replaying sessions");
                    }
                }
            }
        }
        Ok(skipped)
    }

    fn collide(&self, collision: Collision) -> Result<Resolution> {
        let resolution = self.hooks.collisions.resolve(&collision);
        debug!(%collision, ?resolution, "replay collision");
        match resolution {
            Resolution::Error => Err(SyncError::Collision(collision)),
            other => Ok(other),
        }
    }

    async fn resolve(&mut self, reference: &PackagedRef) -> Result<Option<ObjectKey>> {
        self.resolver
            .resolve(&mut self.uow, reference, self.sender)
            .await
    }

    /// Apply one record. Returns the record rewritten in local ids, or `None`
    /// when it was skipped.
    async fn apply(&mut self, record: &PackagedRecord) -> Result<Option<ChangeRecord>> {
        if record.kind == ChangeKind::CommitMarker {
            let mut marker = ChangeRecord::commit_marker(record.modified_at);
            marker.user = record.user.clone();
            return Ok(Some(marker));
        }
        let Some(target) = &record.target else {
            return Ok(None);
        };
        let schema = self.schema;
        let Some(class) = schema.class(&target.class) else {
            self.collide(Collision::new(CollisionKind::ObjectNotFound, &target.class).object(&target.id))?;
            return Ok(None);
        };
        let local = self.resolve(target).await?;

        let applied = match record.kind {
            ChangeKind::ObjectCreated => self.create(target, local).await?,
            ChangeKind::ObjectDeleted => self.delete(target, local)?,
            ChangeKind::PropertyChanged | ChangeKind::InitialValueAssigned => {
                self.assign(class, record, target, local).await?
            }
            ChangeKind::AddedToCollection | ChangeKind::RemovedFromCollection => {
                self.collection(class, record, target, local).await?
            }
            ChangeKind::MethodCall => self.call(class, record, target, local).await?,
            ChangeKind::CommitMarker => None,
        };
        match applied {
            Some(local) => Ok(Some(self.translate(record, target, &local).await?)),
            None => Ok(None),
        }
    }

    fn not_found(&self, target: &PackagedRef) -> Result<Option<ObjectKey>> {
        self.collide(Collision::new(CollisionKind::ObjectNotFound, &target.class).object(&target.id))?;
        Ok(None)
    }

    async fn create(
        &mut self,
        target: &PackagedRef,
        local: Option<ObjectKey>,
    ) -> Result<Option<ObjectKey>> {
        if let Some(existing) = local {
            let collision = Collision::new(CollisionKind::ObjectAlreadyExists, &target.class)
                .object(&target.id);
            return match self.collide(collision)? {
                Resolution::Skip => Ok(None),
                _ => {
                    self.resolver
                        .register(&mut self.uow, target, self.sender, &existing);
                    Ok(Some(existing))
                }
            };
        }
        let key = ObjectKey::generate(target.class.clone());
        for object in self.schema.instantiate(key.clone()) {
            self.uow.create(object);
        }
        self.resolver
            .register(&mut self.uow, target, self.sender, &key);
        Ok(Some(key))
    }

    fn delete(
        &mut self,
        target: &PackagedRef,
        local: Option<ObjectKey>,
    ) -> Result<Option<ObjectKey>> {
        let Some(local) = local else {
            return self.not_found(target);
        };
        self.uow.delete(&local);
        Ok(Some(local))
    }

    async fn assign(
        &mut self,
        class: &ClassInfo,
        record: &PackagedRecord,
        target: &PackagedRef,
        local: Option<ObjectKey>,
    ) -> Result<Option<ObjectKey>> {
        let Some(local) = local else {
            return self.not_found(target);
        };
        let Some(property) = self.property(class, record, target)? else {
            return Ok(None);
        };
        if property.read_only {
            self.collide(
                Collision::new(CollisionKind::ReadOnlyProperty, &class.name)
                    .object(&target.id)
                    .member(&property.name),
            )?;
            return Ok(None);
        }
        if let PackagedValue::Object(old) = &record.old_value {
            if self.resolve(old).await?.is_none() {
                let collision = Collision::new(CollisionKind::ReferenceNotFound, &class.name)
                    .object(&old.id)
                    .member(&property.name);
                if self.collide(collision)? == Resolution::Skip {
                    return Ok(None);
                }
            }
        }
        let Some(mut object) = self.uow.get(&local).await? else {
            return self.not_found(target);
        };

        if record.kind == ChangeKind::InitialValueAssigned {
            if let (true, PackagedValue::Object(incoming), FieldValue::Ref(existing)) = (
                property.is_aggregated(),
                &record.new_value,
                object.get(&property.name),
            ) {
                let existing = existing.clone();
                self.redirect_aggregate(incoming, existing).await?;
                return Ok(Some(local));
            }
            if !self.uow.is_new(&local) {
                return Ok(None);
            }
        }

        let Some(value) = self.value(class, property, &record.new_value).await? else {
            return Ok(None);
        };
        object.set(&property.name, value);
        self.uow.put(object);
        Ok(Some(local))
    }

    /// The owner already holds an aggregate: make the incoming aggregate
    /// resolve to it and drop the copy this package created.
    async fn redirect_aggregate(&mut self, incoming: &PackagedRef, existing: ObjectKey) -> Result<()> {
        let resolved = self.resolve(incoming).await?;
        if resolved.as_ref() == Some(&existing) {
            return Ok(());
        }
        if let Some(duplicate) = resolved {
            if self.uow.is_new(&duplicate) {
                debug!(%duplicate, %existing, "dropping duplicate aggregate");
                self.uow.delete(&duplicate);
            }
        }
        self.resolver
            .register(&mut self.uow, incoming, self.sender, &existing);
        Ok(())
    }

    async fn collection(
        &mut self,
        class: &ClassInfo,
        record: &PackagedRecord,
        target: &PackagedRef,
        local: Option<ObjectKey>,
    ) -> Result<Option<ObjectKey>> {
        let Some(local) = local else {
            return self.not_found(target);
        };
        let Some(property) = self.property(class, record, target)? else {
            return Ok(None);
        };
        if !matches!(property.kind, PropertyKind::Collection { .. }) {
            self.collide(
                Collision::new(CollisionKind::UnknownProperty, &class.name)
                    .object(&target.id)
                    .member(&property.name),
            )?;
            return Ok(None);
        }
        let Some(member) = record.new_value.as_object() else {
            return Err(invalid(class, property, "collection change without a member"));
        };
        let Some(member_key) = self.resolve(member).await? else {
            self.collide(
                Collision::new(CollisionKind::ReferenceNotFound, &class.name)
                    .object(&member.id)
                    .member(&property.name),
            )?;
            return Ok(None);
        };
        let Some(mut object) = self.uow.get(&local).await? else {
            return self.not_found(target);
        };
        if record.kind == ChangeKind::AddedToCollection {
            object.add_member(&property.name, member_key);
        } else {
            object.remove_member(&property.name, &member_key);
        }
        self.uow.put(object);
        Ok(Some(local))
    }

    async fn call(
        &mut self,
        class: &ClassInfo,
        record: &PackagedRecord,
        target: &PackagedRef,
        local: Option<ObjectKey>,
    ) -> Result<Option<ObjectKey>> {
        let Some(local) = local else {
            return self.not_found(target);
        };
        let method = record.property.clone().unwrap_or_default();
        let arity = record.arguments.len();
        let handler = if class.has_method(&method, arity) {
            self.hooks.methods.get(&class.name, &method, arity)
        } else {
            None
        };
        let Some(handler) = handler else {
            self.collide(
                Collision::new(CollisionKind::UnknownMethod, &class.name)
                    .object(&target.id)
                    .member(&method),
            )?;
            return Ok(None);
        };

        let mut args = Vec::with_capacity(arity);
        for arg in &record.arguments {
            args.push(match arg {
                PackagedValue::Null => FieldValue::Null,
                PackagedValue::Scalar { text, raw } => {
                    FieldValue::Scalar(untyped_scalar(text, raw.as_deref()))
                }
                PackagedValue::Object(reference) => match self.resolve(reference).await? {
                    Some(key) => FieldValue::Ref(key),
                    None => FieldValue::Null,
                },
            });
        }
        let Some(mut object) = self.uow.get(&local).await? else {
            return self.not_found(target);
        };
        handler
            .invoke(&mut object, &args)
            .map_err(|reason| SyncError::MethodFailed {
                class: class.name.clone(),
                method: method.clone(),
                reason,
            })?;
        self.uow.put(object);
        Ok(Some(local))
    }

    fn property<'c>(
        &self,
        class: &'c ClassInfo,
        record: &PackagedRecord,
        target: &PackagedRef,
    ) -> Result<Option<&'c PropertyInfo>> {
        let name = record.property.as_deref().unwrap_or_default();
        match class.find_property(name) {
            Some(property) => Ok(Some(property)),
            None => {
                self.collide(
                    Collision::new(CollisionKind::UnknownProperty, &class.name)
                        .object(&target.id)
                        .member(name),
                )?;
                Ok(None)
            }
        }
    }

    /// Convert a packaged new value for `property`. `None` skips the record.
    async fn value(
        &mut self,
        class: &ClassInfo,
        property: &PropertyInfo,
        value: &PackagedValue,
    ) -> Result<Option<FieldValue>> {
        match (&property.kind, value) {
            (_, PackagedValue::Null) => Ok(Some(FieldValue::Null)),
            (PropertyKind::Scalar(ty), PackagedValue::Scalar { text, raw }) => {
                let scalar = typed_scalar(*ty, text, raw.as_deref())
                    .ok_or_else(|| invalid(class, property, &format!("cannot read {text:?} as {ty}")))?;
                Ok(Some(FieldValue::Scalar(scalar)))
            }
            (PropertyKind::Reference { .. }, PackagedValue::Object(reference)) => {
                match self.resolve(reference).await? {
                    Some(key) => Ok(Some(FieldValue::Ref(key))),
                    None => {
                        self.collide(
                            Collision::new(CollisionKind::ReferenceNotFound, &class.name)
                                .object(&reference.id)
                                .member(&property.name),
                        )?;
                        Ok(None)
                    }
                }
            }
            _ => Err(invalid(class, property, "value does not match the property kind")),
        }
    }

    /// Rewrite `record` in local ids for the local change log.
    async fn translate(
        &mut self,
        record: &PackagedRecord,
        target: &PackagedRef,
        local: &ObjectKey,
    ) -> Result<ChangeRecord> {
        let mut translated = ChangeRecord::new(
            record.kind,
            Some(local_ref(target, local)),
            record.modified_at,
        );
        translated.property = record.property.clone();
        translated.old_value = self.local_value(&record.old_value).await?;
        translated.new_value = self.local_value(&record.new_value).await?;
        for arg in &record.arguments {
            let value = self.local_value(arg).await?;
            translated.arguments.push(value);
        }
        translated.user = record.user.clone();
        Ok(translated)
    }

    async fn local_value(&mut self, value: &PackagedValue) -> Result<ChangeValue> {
        Ok(match value {
            PackagedValue::Null => ChangeValue::Null,
            PackagedValue::Scalar { text, raw } => ChangeValue::Scalar {
                text: text.clone(),
                raw: raw.clone(),
            },
            PackagedValue::Object(reference) => match self.resolve(reference).await? {
                Some(key) => ChangeValue::Object(local_ref(reference, &key)),
                None => ChangeValue::Null,
            },
        })
    }
}

fn local_ref(reference: &PackagedRef, local: &ObjectKey) -> ObjectRef {
    ObjectRef {
        assembly: reference.assembly.clone(),
        class: local.class.clone(),
        id: local.id.clone(),
        replication_key: reference.replication_key.clone(),
    }
}

fn invalid(class: &ClassInfo, property: &PropertyInfo, reason: &str) -> SyncError {
    SyncError::InvalidValue {
        class: class.name.clone(),
        property: property.name.clone(),
        reason: reason.to_string(),
    }
}

/// Scalar of type `ty`, preferring the raw form over the text.
pub(crate) fn typed_scalar(ty: ScalarType, text: &str, raw: Option<&[u8]>) -> Option<Scalar> {
    if let Some(scalar) = raw.and_then(|r| Scalar::from_raw(r).ok()) {
        if scalar.scalar_type() == ty {
            return Some(scalar);
        }
    }
    Scalar::parse(ty, text).ok()
}

/// Method arguments carry no declared type: raw form, else text.
fn untyped_scalar(text: &str, raw: Option<&[u8]>) -> Scalar {
    raw.and_then(|r| Scalar::from_raw(r).ok())
        .unwrap_or_else(|| Scalar::Text(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Object, Route, SessionHeader};
    use courier_store::{IdentityEntry, MemoryStore};

    fn schema() -> Schema {
        Schema::new()
            .with_class(
                ClassInfo::new("Invoice")
                    .property(PropertyInfo::scalar("Amount", ScalarType::Int))
                    .property(PropertyInfo::aggregate("Address", "Address")),
            )
            .with_class(
                ClassInfo::new("Address").property(PropertyInfo::scalar("City", ScalarType::Text)),
            )
    }

    fn scalar(value: Scalar) -> PackagedValue {
        PackagedValue::Scalar {
            text: value.to_text(),
            raw: Some(value.to_raw()),
        }
    }

    fn record(
        kind: ChangeKind,
        target: PackagedRef,
        property: Option<&str>,
        new_value: PackagedValue,
        at: i64,
    ) -> PackagedRecord {
        PackagedRecord {
            kind,
            target: Some(target),
            property: property.map(str::to_string),
            old_value: PackagedValue::Null,
            new_value,
            arguments: vec![],
            modified_at: at,
            user: None,
        }
    }

    /// B already holds invoice `local-1` (amount 5) with address
    /// `local-addr`, mapped from A's `r1`.
    async fn store_with_invoice() -> MemoryStore {
        let store = MemoryStore::new();
        let address = ObjectKey::new("Address", "local-addr");
        let mut batch = WriteBatch::new();
        batch.objects_put.push(Object::new(address.clone()));
        batch.objects_put.push(
            Object::new(ObjectKey::new("Invoice", "local-1"))
                .with("Amount", Scalar::Int(5))
                .with("Address", FieldValue::Ref(address)),
        );
        batch
            .identities
            .push(IdentityEntry::new(NodeId::new("A"), "Invoice", "r1", "local-1"));
        store.commit(batch).await.unwrap();
        store
    }

    /// Replay one session from A into `store` on B and commit the result.
    async fn replay(store: &MemoryStore, records: Vec<PackagedRecord>) -> LoadStats {
        let schema = schema();
        let hooks = Hooks::new();
        let current = NodeId::new("B");
        let sender = NodeId::new("A");
        let mut replay = ProtocolReplay {
            resolver: IdentityResolver::new(&schema, &current),
            schema: &schema,
            hooks: &hooks,
            uow: UnitOfWork::new(store),
            sender: &sender,
            current: &current,
            forward: false,
            stats: LoadStats::default(),
        };
        let session = PackagedSession {
            header: SessionHeader {
                id: SessionId::random(),
                parent: None,
                committed_at: 100,
                route: Route::new(),
            },
            records,
        };
        replay
            .run(vec![session], &CancellationToken::new(), None)
            .await
            .unwrap();
        let stats = replay.stats;
        store.commit(replay.uow.into_batch()).await.unwrap();
        stats
    }

    #[tokio::test]
    async fn test_initial_value_skipped_on_existing_object() {
        let store = store_with_invoice().await;
        let invoice = ObjectKey::new("Invoice", "local-1");

        let stats = replay(
            &store,
            vec![record(
                ChangeKind::InitialValueAssigned,
                PackagedRef::new("Invoice", "r1"),
                Some("Amount"),
                scalar(Scalar::Int(9)),
                1,
            )],
        )
        .await;
        assert_eq!(stats.records_skipped, 1);
        assert_eq!(stats.records_applied, 0);
        let object = store.get_object(&invoice).await.unwrap().unwrap();
        assert_eq!(object.get("Amount"), &FieldValue::Scalar(Scalar::Int(5)));

        // A regular change still lands.
        replay(
            &store,
            vec![record(
                ChangeKind::PropertyChanged,
                PackagedRef::new("Invoice", "r1"),
                Some("Amount"),
                scalar(Scalar::Int(9)),
                2,
            )],
        )
        .await;
        let object = store.get_object(&invoice).await.unwrap().unwrap();
        assert_eq!(object.get("Amount"), &FieldValue::Scalar(Scalar::Int(9)));
    }

    #[tokio::test]
    async fn test_aggregate_redirected_onto_existing_owner() {
        let store = store_with_invoice().await;
        let existing = ObjectKey::new("Address", "local-addr");
        let incoming = PackagedRef::new("Address", "ra");

        let stats = replay(
            &store,
            vec![
                record(ChangeKind::ObjectCreated, incoming.clone(), None, PackagedValue::Null, 1),
                record(
                    ChangeKind::InitialValueAssigned,
                    PackagedRef::new("Invoice", "r1"),
                    Some("Address"),
                    PackagedValue::Object(incoming.clone()),
                    2,
                ),
                record(
                    ChangeKind::PropertyChanged,
                    incoming,
                    Some("City"),
                    scalar(Scalar::Text("Oslo".into())),
                    3,
                ),
            ],
        )
        .await;
        assert_eq!(stats.records_applied, 3);

        // The copy created for A's address is gone; its edits hit ours.
        let addresses = store.list_objects("Address").await.unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].key, existing);
        assert_eq!(
            addresses[0].get("City"),
            &FieldValue::Scalar(Scalar::Text("Oslo".into()))
        );
        let invoice = store
            .get_object(&ObjectKey::new("Invoice", "local-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.get("Address"), &FieldValue::Ref(existing.clone()));
        let entry = store
            .lookup_identity(&NodeId::new("A"), "Address", "ra")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.local_key(), existing);
    }

    #[test]
    fn test_raw_value_wins_over_text() {
        let raw = Scalar::Float(0.1).to_raw();
        let scalar = typed_scalar(ScalarType::Float, "0.10000", Some(&raw)).unwrap();
        assert_eq!(scalar, Scalar::Float(0.1));
    }

    #[test]
    fn test_text_used_when_raw_missing_or_mistyped() {
        assert_eq!(typed_scalar(ScalarType::Int, "42", None), Some(Scalar::Int(42)));
        let raw = Scalar::Text("x".into()).to_raw();
        assert_eq!(typed_scalar(ScalarType::Int, "7", Some(&raw)), Some(Scalar::Int(7)));
        assert_eq!(typed_scalar(ScalarType::Int, "seven", None), None);
    }

    #[test]
    fn test_outcome_success() {
        assert!(LoadOutcome::CoveredBySnapshot.is_success());
        assert!(LoadOutcome::Loaded(LoadStats::default()).is_success());
        assert!(!LoadOutcome::Rejected(ValidationError::EmptyPayload).is_success());
        assert!(!LoadOutcome::Failed("x".into()).is_success());
    }
}

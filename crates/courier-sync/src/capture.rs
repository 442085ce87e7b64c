//! Local change capture.
//!
//! An [`EditSession`] is how the application mutates the replicated graph:
//! every mutation is applied to a [`UnitOfWork`] and recorded as a change
//! record, so the object writes and the change log commit together.

use courier_core::{
    now_millis, ChangeKind, ChangeRecord, ChangeSession, ChangeValue, FieldValue, Object,
    ObjectKey, ObjectRef, PropertyKind, Schema, SessionId,
};
use courier_store::Store;

use crate::error::{Result, SyncError};
use crate::uow::UnitOfWork;

/// Local edits recorded as nested change sessions and committed atomically.
pub struct EditSession<'a, S: Store + ?Sized> {
    schema: &'a Schema,
    uow: UnitOfWork<'a, S>,
    /// Open sessions, innermost last.
    open: Vec<ChangeSession>,
    user: Option<String>,
    clock: Option<i64>,
    last: i64,
    root: SessionId,
}

impl<'a, S: Store + ?Sized> EditSession<'a, S> {
    /// Open an edit session with a root change session.
    pub fn new(store: &'a S, schema: &'a Schema) -> Self {
        let root = SessionId::random();
        Self {
            schema,
            uow: UnitOfWork::new(store),
            open: vec![ChangeSession::new(root, 0)],
            user: None,
            clock: None,
            last: 0,
            root,
        }
    }

    /// Attribute subsequent records to `user`.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Pin the modification time of subsequent records.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.clock = Some(timestamp);
        self
    }

    /// Same as [`Self::at`] on a borrowed session.
    pub fn set_time(&mut self, timestamp: i64) {
        self.clock = Some(timestamp);
    }

    /// Id of the innermost open session.
    pub fn session_id(&self) -> SessionId {
        self.open.last().map_or(self.root, |s| s.id)
    }

    fn tick(&mut self) -> i64 {
        let now = self.clock.unwrap_or_else(now_millis);
        // Never go backwards within one edit session.
        self.last = self.last.max(now);
        self.last
    }

    fn record(&mut self, record: ChangeRecord) {
        let mut record = record;
        record.user = self.user.clone();
        if let Some(session) = self.open.last_mut() {
            session.records.push(record);
        }
    }

    fn object_ref(&self, key: &ObjectKey, object: Option<&Object>) -> ObjectRef {
        let mut reference = ObjectRef::from(key);
        if let Some(class) = self.schema.class(&key.class) {
            reference.assembly = class.assembly.clone();
            reference.replication_key = object.and_then(|o| class.natural_key_of(o));
        }
        reference
    }

    fn change_value(&self, value: &FieldValue) -> ChangeValue {
        match value {
            FieldValue::Null | FieldValue::Collection(_) => ChangeValue::Null,
            FieldValue::Scalar(s) => ChangeValue::scalar(s),
            FieldValue::Ref(key) => ChangeValue::Object(self.object_ref(key, None)),
        }
    }

    async fn require(&self, key: &ObjectKey) -> Result<Object> {
        self.uow
            .get(key)
            .await?
            .ok_or_else(|| SyncError::UnknownObject(key.clone()))
    }

    /// Create an object of `class` together with its aggregates.
    pub async fn create(&mut self, class: &str) -> Result<ObjectKey> {
        if self.schema.class(class).is_none() {
            return Err(SyncError::UnknownClass(class.to_string()));
        }
        let key = ObjectKey::generate(class);
        let created = self.schema.instantiate(key.clone());
        let at = self.tick();

        for object in &created {
            let reference = self.object_ref(&object.key, Some(object));
            self.record(ChangeRecord::new(ChangeKind::ObjectCreated, Some(reference), at));
        }
        for object in &created {
            let Some(class) = self.schema.class(&object.key.class) else {
                continue;
            };
            for property in &class.properties {
                if let PropertyKind::Reference {
                    auto_create: true, ..
                } = property.kind
                {
                    let value = object.get(&property.name);
                    if value.is_null() {
                        continue;
                    }
                    let record = ChangeRecord::new(
                        ChangeKind::InitialValueAssigned,
                        Some(self.object_ref(&object.key, Some(object))),
                        at,
                    )
                    .property(property.name.clone())
                    .values(ChangeValue::Null, self.change_value(value));
                    self.record(record);
                }
            }
        }
        for object in created {
            self.uow.create(object);
        }
        Ok(key)
    }

    /// Assign a property.
    pub async fn set(&mut self, key: &ObjectKey, property: &str, value: FieldValue) -> Result<()> {
        let mut object = self.require(key).await?;
        let old = self.change_value(object.get(property));
        let new = self.change_value(&value);
        object.set(property, value);
        let at = self.tick();
        let record = ChangeRecord::new(
            ChangeKind::PropertyChanged,
            Some(self.object_ref(key, Some(&object))),
            at,
        )
        .property(property)
        .values(old, new);
        self.record(record);
        self.uow.put(object);
        Ok(())
    }

    /// Add `member` to the collection `property` of `key`.
    pub async fn add_member(&mut self, key: &ObjectKey, property: &str, member: &ObjectKey) -> Result<()> {
        self.membership(key, property, member, ChangeKind::AddedToCollection)
            .await
    }

    /// Remove `member` from the collection `property` of `key`.
    pub async fn remove_member(
        &mut self,
        key: &ObjectKey,
        property: &str,
        member: &ObjectKey,
    ) -> Result<()> {
        self.membership(key, property, member, ChangeKind::RemovedFromCollection)
            .await
    }

    async fn membership(
        &mut self,
        key: &ObjectKey,
        property: &str,
        member: &ObjectKey,
        kind: ChangeKind,
    ) -> Result<()> {
        let mut object = self.require(key).await?;
        if kind == ChangeKind::AddedToCollection {
            object.add_member(property, member.clone());
        } else {
            object.remove_member(property, member);
        }
        let at = self.tick();
        let record = ChangeRecord::new(kind, Some(self.object_ref(key, Some(&object))), at)
            .property(property)
            .values(
                ChangeValue::Null,
                ChangeValue::Object(self.object_ref(member, None)),
            );
        self.record(record);
        self.uow.put(object);
        Ok(())
    }

    /// Delete `key`.
    pub async fn delete(&mut self, key: &ObjectKey) -> Result<()> {
        let object = self.require(key).await?;
        let at = self.tick();
        let reference = self.object_ref(key, Some(&object));
        self.record(ChangeRecord::new(ChangeKind::ObjectDeleted, Some(reference), at));
        self.uow.delete(key);
        Ok(())
    }

    /// Record a method call. The application has already run it locally
    /// and applied its effects through this session.
    pub async fn call(&mut self, key: &ObjectKey, method: &str, args: Vec<FieldValue>) -> Result<()> {
        let object = self.require(key).await?;
        let at = self.tick();
        let args = args.iter().map(|a| self.change_value(a)).collect();
        let record = ChangeRecord::new(
            ChangeKind::MethodCall,
            Some(self.object_ref(key, Some(&object))),
            at,
        )
        .property(method)
        .arguments(args);
        self.record(record);
        Ok(())
    }

    /// Open a nested session.
    pub fn begin_nested(&mut self) -> SessionId {
        let parent = self.session_id();
        let session = ChangeSession::new(SessionId::random(), 0).child_of(parent);
        let id = session.id;
        self.open.push(session);
        self.uow.begin();
        id
    }

    /// Close the innermost nested session.
    pub fn end_nested(&mut self) {
        if self.open.len() < 2 {
            return;
        }
        let at = self.tick();
        if let Some(session) = self.open.pop() {
            self.close(session, at);
        }
        self.uow.commit_layer();
    }

    /// Abandon the innermost nested session and its writes.
    pub fn abort_nested(&mut self) {
        if self.open.len() < 2 {
            return;
        }
        self.open.pop();
        self.uow.rollback_layer();
    }

    fn close(&mut self, mut session: ChangeSession, at: i64) {
        let mut marker = ChangeRecord::commit_marker(at);
        marker.user = self.user.clone();
        session.records.push(marker);
        session.committed_at = at;
        self.uow.record_session(session);
    }

    /// Close every open session and commit objects and change log together.
    pub async fn commit(mut self) -> Result<Vec<SessionId>> {
        while self.open.len() > 1 {
            self.end_nested();
        }
        let at = self.tick();
        if let Some(root) = self.open.pop() {
            self.close(root, at);
        }
        let store = self.uow.store();
        let batch = self.uow.into_batch();
        let ids = batch.sessions.iter().map(|s| s.id).collect();
        store.commit(batch).await?;
        Ok(ids)
    }
}

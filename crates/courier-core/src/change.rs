//! Change log: sessions of captured local mutations and their records.
//!
//! Sessions nest the way transactions nest. Records are immutable once
//! captured.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::object::Scalar;
use crate::types::{NodeId, ObjectKey, SessionId};

/// Kind of a captured mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    ObjectCreated,
    ObjectDeleted,
    PropertyChanged,
    InitialValueAssigned,
    AddedToCollection,
    RemovedFromCollection,
    MethodCall,
    CommitMarker,
}

impl ChangeKind {
    /// Commit markers close a nested session; they carry no mutation.
    pub fn is_commit_marker(&self) -> bool {
        matches!(self, ChangeKind::CommitMarker)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity descriptor of an object as captured in the change log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub assembly: String,
    pub class: String,
    /// Local object id on the node that captured the change.
    pub id: String,
    /// Business key, when the class declares one.
    pub replication_key: Option<String>,
}

impl ObjectRef {
    pub fn new(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            assembly: String::new(),
            class: class.into(),
            id: id.into(),
            replication_key: None,
        }
    }

    pub fn with_replication_key(mut self, key: impl Into<String>) -> Self {
        self.replication_key = Some(key.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.class.clone(), self.id.clone())
    }
}

impl From<&ObjectKey> for ObjectRef {
    fn from(key: &ObjectKey) -> Self {
        ObjectRef::new(key.class.clone(), key.id.clone())
    }
}

/// Old or new value of a mutation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ChangeValue {
    #[default]
    Null,
    /// Primitive value in textual form, plus the raw serialized value when
    /// the capture layer had one.
    Scalar { text: String, raw: Option<Vec<u8>> },
    Object(ObjectRef),
}

impl ChangeValue {
    /// Capture a scalar with both textual and raw forms.
    pub fn scalar(value: &Scalar) -> Self {
        ChangeValue::Scalar {
            text: value.to_text(),
            raw: Some(value.to_raw()),
        }
    }

    /// Capture a scalar known only by its text.
    pub fn text(text: impl Into<String>) -> Self {
        ChangeValue::Scalar {
            text: text.into(),
            raw: None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            ChangeValue::Object(r) => Some(r),
            _ => None,
        }
    }
}

/// One captured mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub target: Option<ObjectRef>,
    /// Property or method name.
    pub property: Option<String>,
    pub old_value: ChangeValue,
    pub new_value: ChangeValue,
    /// Method-call arguments.
    pub arguments: Vec<ChangeValue>,
    pub modified_at: i64,
    pub user: Option<String>,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, target: Option<ObjectRef>, modified_at: i64) -> Self {
        Self {
            kind,
            target,
            property: None,
            old_value: ChangeValue::Null,
            new_value: ChangeValue::Null,
            arguments: Vec::new(),
            modified_at,
            user: None,
        }
    }

    pub fn commit_marker(modified_at: i64) -> Self {
        Self::new(ChangeKind::CommitMarker, None, modified_at)
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.property = Some(name.into());
        self
    }

    pub fn values(mut self, old: ChangeValue, new: ChangeValue) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    pub fn arguments(mut self, args: Vec<ChangeValue>) -> Self {
        self.arguments = args;
        self
    }

    pub fn is_real(&self) -> bool {
        !self.kind.is_commit_marker()
    }
}

/// Trail of node ids a session has already passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route(Vec<NodeId>);

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the newline-joined trail form.
    pub fn from_trail(trail: &str) -> Self {
        Self(
            trail
                .lines()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(NodeId::new)
                .collect(),
        )
    }

    /// Newline-joined trail form.
    pub fn to_trail(&self) -> String {
        self.0
            .iter()
            .map(NodeId::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    /// Append `node` unless it is already in the trail.
    pub fn push(&mut self, node: NodeId) {
        if !self.contains(&node) {
            self.0.push(node);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.0
    }
}

/// A committed transactional unit of captured mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSession {
    pub id: SessionId,
    pub parent: Option<SessionId>,
    pub committed_at: i64,
    pub route: Route,
    /// Already packaged.
    pub saved: bool,
    pub records: Vec<ChangeRecord>,
}

impl ChangeSession {
    pub fn new(id: SessionId, committed_at: i64) -> Self {
        Self {
            id,
            parent: None,
            committed_at,
            route: Route::new(),
            saved: false,
            records: Vec::new(),
        }
    }

    pub fn child_of(mut self, parent: SessionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn has_real_records(&self) -> bool {
        self.records.iter().any(ChangeRecord::is_real)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_trail_roundtrip() {
        let mut route = Route::new();
        route.push(NodeId::new("A"));
        route.push(NodeId::new("B"));
        route.push(NodeId::new("A"));
        assert_eq!(route.to_trail(), "A\nB");
        assert_eq!(Route::from_trail("A\nB\n"), route);
        assert!(route.contains(&NodeId::new("B")));
        assert!(!route.contains(&NodeId::new("C")));
    }

    #[test]
    fn test_session_real_records() {
        let mut session = ChangeSession::new(SessionId::random(), 1);
        session.records.push(ChangeRecord::commit_marker(1));
        assert!(!session.has_real_records());
        session.records.push(ChangeRecord::new(
            ChangeKind::ObjectCreated,
            Some(ObjectRef::new("Invoice", "1")),
            1,
        ));
        assert!(session.has_real_records());
    }
}

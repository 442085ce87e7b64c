//! Strong type definitions for Courier.
//!
//! All identifiers are newtypes to prevent misuse at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a replica participating in replication.
///
/// Node ids appear inside package file names, which use `-` as the field
/// separator, so they must not contain it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id. See [`NodeId::is_valid`] for the file name rules.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id can be embedded in a package file name.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(['-', '.', '\n'])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 128-bit identifier of a change session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from a raw 128-bit value.
    pub const fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local identity of an object in the object graph: class plus key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Class name.
    pub class: String,
    /// String form of the object's primary key.
    pub id: String,
}

impl ObjectKey {
    /// Create a key.
    pub fn new(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            id: id.into(),
        }
    }

    /// Generate a key with a fresh random id.
    pub fn generate(class: impl Into<String>) -> Self {
        Self::new(class, Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

/// Get current time in milliseconds.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validity() {
        assert!(NodeId::new("A").is_valid());
        assert!(NodeId::new("branch_7").is_valid());
        assert!(!NodeId::new("").is_valid());
        assert!(!NodeId::new("a-b").is_valid());
        assert!(!NodeId::new("a.b").is_valid());
    }

    #[test]
    fn test_session_id_bytes_roundtrip() {
        let id = SessionId::from_u128(0x1234);
        assert_eq!(SessionId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("Invoice", "1");
        assert_eq!(key.to_string(), "Invoice#1");
        assert_eq!(format!("{:?}", key), "Invoice#1");
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = ObjectKey::generate("Invoice");
        let b = ObjectKey::generate("Invoice");
        assert_ne!(a, b);
        assert_eq!(a.class, "Invoice");
    }
}

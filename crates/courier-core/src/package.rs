//! Transport-unit model: packages, markers, packaged sessions and records,
//! snapshot identity records and tickets.
//!
//! This module is pure data. Encoding lives in [`crate::canonical`] and
//! checks in [`crate::validation`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::change::{ChangeKind, Route};
use crate::error::{CoreError, Result};
use crate::object::Scalar;
use crate::types::{NodeId, ObjectKey, SessionId};

/// Name used in file names for packages addressed to every node.
pub const ALL_NODES: &str = "AllNodes";

/// Discriminator for package payload interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PackageKind {
    /// Incremental change sessions.
    Protocol,
    /// Full point-in-time copy.
    Snapshot,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageKind::Protocol => f.write_str("Protocol"),
            PackageKind::Snapshot => f.write_str("Snapshot"),
        }
    }
}

impl FromStr for PackageKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Protocol" => Ok(PackageKind::Protocol),
            "Snapshot" => Ok(PackageKind::Snapshot),
            other => Err(CoreError::InvalidPackageName(format!(
                "unknown package kind {other:?}"
            ))),
        }
    }
}

/// Addressee of a package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Node(NodeId),
    AllNodes,
}

impl Recipient {
    /// Whether a package with this addressee is meant for `node`.
    pub fn includes(&self, node: &NodeId) -> bool {
        match self {
            Recipient::Node(id) => id == node,
            Recipient::AllNodes => true,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Node(id) => f.write_str(id.as_str()),
            Recipient::AllNodes => f.write_str(ALL_NODES),
        }
    }
}

/// The external identity of a package, encoded in its file name:
/// `{application}-{sender}-{recipient|AllNodes}-{8-hex-seq}-{Protocol|Snapshot}.ext`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageName {
    pub application: String,
    pub sender: NodeId,
    pub recipient: Recipient,
    pub seq: u64,
    pub kind: PackageKind,
}

impl PackageName {
    /// Create a name, checking every component can live in a file name.
    pub fn new(
        application: impl Into<String>,
        sender: NodeId,
        recipient: Recipient,
        seq: u64,
        kind: PackageKind,
    ) -> Result<Self> {
        let application = application.into();
        if application.is_empty() || application.contains(['-', '.']) {
            return Err(CoreError::InvalidPackageName(format!(
                "invalid application name {application:?}"
            )));
        }
        if !sender.is_valid() {
            return Err(CoreError::InvalidNodeId(sender.to_string()));
        }
        if let Recipient::Node(id) = &recipient {
            if !id.is_valid() || id.as_str() == ALL_NODES {
                return Err(CoreError::InvalidNodeId(id.to_string()));
            }
        }
        Ok(Self {
            application,
            sender,
            recipient,
            seq,
            kind,
        })
    }

    /// File name stem, without extension.
    pub fn stem(&self) -> String {
        format!(
            "{}-{}-{}-{:08x}-{}",
            self.application, self.sender, self.recipient, self.seq, self.kind
        )
    }

    /// Full file name with the given extension.
    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{}", self.stem(), ext)
    }

    /// Parse a file name (extension optional).
    pub fn parse(file_name: &str) -> Result<Self> {
        let stem = match file_name.rsplit_once('.') {
            Some((stem, _ext)) => stem,
            None => file_name,
        };
        let parts: Vec<&str> = stem.split('-').collect();
        let [application, sender, recipient, seq, kind] = parts.as_slice() else {
            return Err(CoreError::InvalidPackageName(file_name.to_string()));
        };
        if seq.len() < 8 {
            return Err(CoreError::InvalidPackageName(file_name.to_string()));
        }
        let seq = u64::from_str_radix(seq, 16)
            .map_err(|_| CoreError::InvalidPackageName(file_name.to_string()))?;
        let recipient = if *recipient == ALL_NODES {
            Recipient::AllNodes
        } else {
            Recipient::Node(NodeId::new(*recipient))
        };
        Self::new(*application, NodeId::new(*sender), recipient, seq, kind.parse()?)
    }

    /// Name of the ticket `from` sends back about this package. Tickets travel
    /// the opposite way, so sender and recipient swap.
    pub fn ticket_name(&self, from: &NodeId) -> PackageName {
        PackageName {
            application: self.application.clone(),
            sender: from.clone(),
            recipient: Recipient::Node(self.sender.clone()),
            seq: self.seq,
            kind: self.kind,
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem())
    }
}

/// Current package format version.
pub const PACKAGE_VERSION: u8 = 1;

/// Self-describing header embedded in every package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub version: u8,
    pub application: String,
    pub sender: NodeId,
    pub recipient: Recipient,
    pub seq: u64,
    pub kind: PackageKind,
    /// Package date (Unix ms).
    pub created_at: i64,
    /// Snapshots only: the sender sequence number protocol replay resumes after.
    pub resume_seq: Option<u64>,
    /// Number of entries following the marker.
    pub entry_count: u64,
    /// Blake3 digest of the encoded entries.
    pub digest: [u8; 32],
}

impl Marker {
    /// The name this marker claims to belong to.
    pub fn name(&self) -> PackageName {
        PackageName {
            application: self.application.clone(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            seq: self.seq,
            kind: self.kind,
        }
    }
}

/// A (node, remote object id) breadcrumb accumulated along the hops an
/// object has travelled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnownMapping {
    pub node: NodeId,
    pub object_id: String,
}

/// Packaged form of an object reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagedRef {
    pub assembly: String,
    pub class: String,
    /// Object id on the sending node.
    pub id: String,
    pub replication_key: Option<String>,
    pub known_mapping: Vec<KnownMapping>,
}

impl PackagedRef {
    pub fn new(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            assembly: String::new(),
            class: class.into(),
            id: id.into(),
            replication_key: None,
            known_mapping: Vec::new(),
        }
    }

    /// Key of the object on the sending node.
    pub fn sender_key(&self) -> ObjectKey {
        ObjectKey::new(self.class.clone(), self.id.clone())
    }
}

/// Packaged old/new value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PackagedValue {
    #[default]
    Null,
    Scalar { text: String, raw: Option<Vec<u8>> },
    Object(PackagedRef),
}

impl PackagedValue {
    pub fn as_object(&self) -> Option<&PackagedRef> {
        match self {
            PackagedValue::Object(r) => Some(r),
            _ => None,
        }
    }
}

/// Packaged form of a change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagedRecord {
    pub kind: ChangeKind,
    pub target: Option<PackagedRef>,
    pub property: Option<String>,
    pub old_value: PackagedValue,
    pub new_value: PackagedValue,
    pub arguments: Vec<PackagedValue>,
    pub modified_at: i64,
    pub user: Option<String>,
}

/// Packaged session header. Records are separate entries on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: SessionId,
    pub parent: Option<SessionId>,
    pub committed_at: i64,
    pub route: Route,
}

/// A packaged session with its records, as assembled on load.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedSession {
    pub header: SessionHeader,
    pub records: Vec<PackagedRecord>,
}

/// Field of a cloned object. References point at other clones by handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnapshotField {
    Null,
    Scalar(Scalar),
    Ref(u32),
    Collection(Vec<u32>),
}

/// One cloned object inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotObject {
    pub handle: u32,
    pub class: String,
    pub fields: Vec<(String, SnapshotField)>,
}

/// Identity record for one cloned object; ordinals give the replay order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIdentity {
    pub ordinal: u64,
    pub handle: u32,
    pub reference: PackagedRef,
}

/// One item in a package's entry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Session(SessionHeader),
    Record {
        session: SessionId,
        record: PackagedRecord,
    },
    Object(SnapshotObject),
    Identity(SnapshotIdentity),
}

/// Decoded package body.
#[derive(Debug, Clone, PartialEq)]
pub enum PackageBody {
    Protocol {
        sessions: Vec<PackagedSession>,
    },
    Snapshot {
        objects: Vec<SnapshotObject>,
        identities: Vec<SnapshotIdentity>,
    },
}

/// A decoded package.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub marker: Marker,
    pub body: PackageBody,
}

/// A sealed package: name plus opaque (packed) bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPackage {
    pub name: PackageName,
    pub created_at: i64,
    pub bytes: Vec<u8>,
}

/// Delivery-status event carried by a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketEvent {
    Imported,
    Loaded,
    Rejected,
    Sent,
}

impl fmt::Display for TicketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Small reverse-direction notice about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// The package this ticket is about.
    pub package: PackageName,
    /// Node that issued the ticket.
    pub from: NodeId,
    pub event: TicketEvent,
    pub at: i64,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(recipient: Recipient, seq: u64) -> PackageName {
        PackageName::new("App", NodeId::new("A"), recipient, seq, PackageKind::Protocol).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let n = name(Recipient::AllNodes, 1);
        assert_eq!(n.file_name("pkg"), "App-A-AllNodes-00000001-Protocol.pkg");

        let n = name(Recipient::Node(NodeId::new("B")), 0x1f);
        assert_eq!(n.stem(), "App-A-B-0000001f-Protocol");
    }

    #[test]
    fn test_parse_file_name() {
        let parsed = PackageName::parse("App-A-AllNodes-00000001-Protocol.pkg").unwrap();
        assert_eq!(parsed, name(Recipient::AllNodes, 1));

        let parsed = PackageName::parse("App-C-B-0000000a-Snapshot.pkg").unwrap();
        assert_eq!(parsed.sender, NodeId::new("C"));
        assert_eq!(parsed.recipient, Recipient::Node(NodeId::new("B")));
        assert_eq!(parsed.seq, 10);
        assert_eq!(parsed.kind, PackageKind::Snapshot);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(PackageName::parse("App-A-B-1-Protocol.pkg").is_err());
        assert!(PackageName::parse("App-A-B-00000001-Delta.pkg").is_err());
        assert!(PackageName::parse("App-A-00000001-Protocol.pkg").is_err());
        assert!(PackageName::parse("App-A-B-zzzzzzzz-Protocol.pkg").is_err());
    }

    #[test]
    fn test_new_rejects_dashes() {
        assert!(PackageName::new(
            "My-App",
            NodeId::new("A"),
            Recipient::AllNodes,
            1,
            PackageKind::Protocol
        )
        .is_err());
        assert!(PackageName::new(
            "App",
            NodeId::new("A-1"),
            Recipient::AllNodes,
            1,
            PackageKind::Protocol
        )
        .is_err());
    }

    #[test]
    fn test_ticket_name_swaps_direction() {
        let n = name(Recipient::AllNodes, 3);
        let t = n.ticket_name(&NodeId::new("B"));
        assert_eq!(t.sender, NodeId::new("B"));
        assert_eq!(t.recipient, Recipient::Node(NodeId::new("A")));
        assert_eq!(t.seq, 3);
    }

    #[test]
    fn test_names_sort_by_sender_then_sequence() {
        let mut names = vec![
            name(Recipient::AllNodes, 2),
            PackageName::new("App", NodeId::new("B"), Recipient::AllNodes, 1, PackageKind::Protocol)
                .unwrap(),
            name(Recipient::AllNodes, 1),
        ];
        names.sort();
        let order: Vec<(String, u64)> =
            names.iter().map(|n| (n.sender.to_string(), n.seq)).collect();
        assert_eq!(
            order,
            vec![("A".into(), 1), ("A".into(), 2), ("B".into(), 1)]
        );
        assert!(PackageKind::Protocol < PackageKind::Snapshot);
    }

    #[test]
    fn test_recipient_includes() {
        let b = NodeId::new("B");
        assert!(Recipient::AllNodes.includes(&b));
        assert!(Recipient::Node(b.clone()).includes(&b));
        assert!(!Recipient::Node(NodeId::new("C")).includes(&b));
    }

    proptest::proptest! {
        #[test]
        fn prop_file_names_parse_back(
            app in "[A-Z][a-z]{0,6}",
            sender in "[A-Z][a-z0-9]{0,6}",
            recipient in proptest::option::of("[A-Z][a-z0-9]{0,6}"),
            seq in 0u64..=u32::MAX as u64,
            snapshot in proptest::bool::ANY,
        ) {
            let recipient = recipient.map_or(Recipient::AllNodes, |r| Recipient::Node(NodeId::new(r)));
            let kind = if snapshot { PackageKind::Snapshot } else { PackageKind::Protocol };
            let n = PackageName::new(app, NodeId::new(sender), recipient, seq, kind).unwrap();
            proptest::prop_assert_eq!(PackageName::parse(&n.file_name("pkg")).unwrap(), n);
        }
    }
}

//! Node: a peer identity and its per-direction replication counters.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A replica participating in replication, as seen from the local database.
///
/// Exactly one node record per database is flagged `is_current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node id.
    pub id: NodeId,

    /// Transport address (folder, URL, ...). Opaque to the engine.
    pub address: String,

    /// Whether this record describes the local node.
    pub is_current: bool,

    /// Disabled peers receive nothing.
    pub disabled: bool,

    /// Last sequence number packaged for this node.
    pub last_saved_seq: u64,

    /// Last sequence number loaded from this node.
    pub last_loaded_seq: u64,

    /// Sequence number of the last snapshot packaged for this node.
    pub last_saved_snapshot_seq: u64,

    /// Sequence number of the last snapshot loaded from this node.
    pub last_loaded_snapshot_seq: u64,

    /// Changes at or before this time are covered by a snapshot sent to this node.
    pub snapshot_watermark: Option<i64>,

    /// Protocol packages from this node dated before this time are covered by
    /// a snapshot loaded from it.
    pub bootstrap_watermark: Option<i64>,
}

impl Node {
    /// Create a peer record.
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            is_current: false,
            disabled: false,
            last_saved_seq: 0,
            last_loaded_seq: 0,
            last_saved_snapshot_seq: 0,
            last_loaded_snapshot_seq: 0,
            snapshot_watermark: None,
            bootstrap_watermark: None,
        }
    }

    /// Create the record for the local node.
    pub fn current(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            is_current: true,
            ..Self::new(id, address)
        }
    }

    /// Sequence number the next outgoing package to this node will carry.
    pub fn next_saved_seq(&self) -> u64 {
        self.last_saved_seq + 1
    }

    /// Sequence number the next incoming protocol package must carry.
    pub fn expected_loaded_seq(&self) -> u64 {
        self.last_loaded_seq + 1
    }

    /// Whether a change made at `timestamp` is already covered by a snapshot
    /// sent to this node.
    pub fn covered_by_snapshot(&self, timestamp: i64) -> bool {
        matches!(self.snapshot_watermark, Some(w) if timestamp <= w)
    }

    /// Whether a package from this node dated `timestamp` predates the last
    /// snapshot loaded from it.
    pub fn predates_bootstrap(&self, timestamp: i64) -> bool {
        matches!(self.bootstrap_watermark, Some(w) if timestamp < w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_helpers() {
        let mut node = Node::new(NodeId::new("B"), "");
        assert_eq!(node.next_saved_seq(), 1);
        assert_eq!(node.expected_loaded_seq(), 1);

        node.last_saved_seq = 4;
        node.last_loaded_seq = 9;
        assert_eq!(node.next_saved_seq(), 5);
        assert_eq!(node.expected_loaded_seq(), 10);
    }

    #[test]
    fn test_watermarks() {
        let mut node = Node::new(NodeId::new("A"), "");
        assert!(!node.covered_by_snapshot(100));
        assert!(!node.predates_bootstrap(100));

        node.snapshot_watermark = Some(100);
        node.bootstrap_watermark = Some(100);
        assert!(node.covered_by_snapshot(100));
        assert!(!node.covered_by_snapshot(101));
        assert!(node.predates_bootstrap(99));
        assert!(!node.predates_bootstrap(100));
    }
}

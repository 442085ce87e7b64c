//! Engine configuration.

use serde::{Deserialize, Serialize};

/// How recipients are chosen for outgoing packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutingMode {
    /// One package per build addressed to all nodes, numbered with the
    /// current node's own counter.
    #[default]
    Broadcast,
    /// One package per enabled peer, numbered per peer.
    PointToPoint,
}

/// Configuration for the replication engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name, the first field of every package file name.
    pub application: String,
    pub routing: RoutingMode,
    /// Accept packages from senders without a node record, creating one.
    pub allow_anonymous_packages: bool,
    /// Entry buffers larger than this spill to a temp file.
    pub spill_threshold: usize,
    /// Leave replayed sessions unsaved so the next build relays them.
    pub forward_replayed_sessions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application: "Courier".to_string(),
            routing: RoutingMode::Broadcast,
            allow_anonymous_packages: false,
            spill_threshold: 4 * 1024 * 1024,
            forward_replayed_sessions: true,
        }
    }
}

impl EngineConfig {
    /// Broadcast configuration for `application` with default limits.
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            ..Self::default()
        }
    }

    /// Address packages to each peer instead of to all nodes.
    pub fn point_to_point(mut self) -> Self {
        self.routing = RoutingMode::PointToPoint;
        self
    }

    /// Accept packages from senders without a node record.
    pub fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous_packages = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"application":"Shop","routing":"PointToPoint"}"#).unwrap();
        assert_eq!(config.application, "Shop");
        assert_eq!(config.routing, RoutingMode::PointToPoint);
        assert!(config.forward_replayed_sessions);
        assert_eq!(config.spill_threshold, EngineConfig::default().spill_threshold);
    }
}

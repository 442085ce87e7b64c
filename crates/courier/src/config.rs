//! Service configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use courier_sync::EngineConfig;

use crate::error::Result;

/// What a failed package does to the rest of a batch load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// Stop the whole batch at the first rejected or failed package.
    #[default]
    HaltOnFailure,
    /// Stop only the failing sender's stream; other senders continue.
    IsolateSender,
}

/// Configuration for a [`Replicator`](crate::Replicator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    pub engine: EngineConfig,
    pub batch_policy: BatchPolicy,
    /// File extension of packages on the transport.
    pub package_extension: String,
    /// File extension of tickets on the transport.
    pub ticket_extension: String,
    /// Send `Loaded`/`Rejected` tickets back to package senders.
    pub send_tickets: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            batch_policy: BatchPolicy::HaltOnFailure,
            package_extension: "pkg".to_string(),
            ticket_extension: "tkt".to_string(),
            send_tickets: true,
        }
    }
}

impl ReplicatorConfig {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    pub fn without_tickets(mut self) -> Self {
        self.send_tickets = false;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON configuration file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sync::RoutingMode;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ReplicatorConfig::from_json(
            r#"{"engine":{"application":"Shop","routing":"PointToPoint"},"batch_policy":"IsolateSender"}"#,
        )
        .unwrap();
        assert_eq!(config.engine.application, "Shop");
        assert_eq!(config.engine.routing, RoutingMode::PointToPoint);
        assert_eq!(config.batch_policy, BatchPolicy::IsolateSender);
        assert_eq!(config.package_extension, "pkg");
        assert!(config.send_tickets);
    }

    #[test]
    fn test_rejects_unknown_policy() {
        assert!(ReplicatorConfig::from_json(r#"{"batch_policy":"Skip"}"#).is_err());
    }
}

//! Replication configuration

use super::heartbeat::HeartbeatConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Host this node is reachable at (written to the descriptor and sent on join)
    pub host: String,

    /// Port this node is reachable at
    pub port: u16,

    /// Shared primary descriptor file
    pub primary_file: PathBuf,

    /// Connect timeout for peer calls
    pub connect_timeout: Duration,

    /// Reply timeout for peer calls
    pub io_timeout: Duration,

    /// Failure detection
    pub heartbeat: HeartbeatConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            primary_file: PathBuf::from("primary.txt"),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Configuration for a node reachable at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the descriptor path
    pub fn with_primary_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.primary_file = path.into();
        self
    }

    /// Set heartbeat settings
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Disable the heartbeat (single node, or tests driving failover by hand)
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat.enabled = false;
        self
    }

    /// This node's address as `host:port`
    pub fn self_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".into());
        }
        if self.port == 0 {
            return Err("port must be set explicitly for replication".into());
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err("peer timeouts must be greater than zero".into());
        }
        if self.heartbeat.enabled {
            self.heartbeat.validate()?;
        }
        Ok(())
    }
}

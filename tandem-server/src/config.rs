//! Server configuration

use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::{HeartbeatConfig, NodeConfig, ReplicationConfig};
use thiserror::Error;

/// Configuration loading failures
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this layout
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        /// Path that was parsed
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// An environment variable holds an unusable value
    #[error("Invalid {var}: {value}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// Values are individually valid but inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address; also the address advertised to the peer
    pub addr: SocketAddr,
    /// Served files and the log live here
    pub data_dir: PathBuf,
    /// Shared primary descriptor
    pub primary_file: PathBuf,
    /// Failure detection
    pub heartbeat: HeartbeatSection,
    /// Timeouts and size limits
    pub limits: LimitsSection,
}

/// `[heartbeat]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Whether to broadcast and watch heartbeats at all
    pub enabled: bool,
    /// Multicast group and port
    pub group: SocketAddrV4,
    /// Local interface joined to the group
    pub interface: Ipv4Addr,
    /// Broadcast interval in milliseconds
    pub interval_ms: u64,
    /// Silence tolerated before failover, in milliseconds
    pub deadline_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        let defaults = HeartbeatConfig::default();
        Self {
            enabled: defaults.enabled,
            group: defaults.group,
            interface: defaults.interface,
            interval_ms: defaults.interval.as_millis() as u64,
            deadline_ms: defaults.deadline.as_millis() as u64,
        }
    }
}

/// `[limits]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Per-line read timeout on client connections, in milliseconds
    pub read_timeout_ms: u64,
    /// Bytes returned by READ
    pub read_limit: usize,
    /// Largest accepted request body
    pub max_body: usize,
    /// Open transactions older than this are aborted by the sweep
    pub stale_age_secs: u64,
    /// LMDB map size of the log
    pub map_size: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            read_timeout_ms: 3000,
            read_limit: node.read_limit,
            max_body: 64 * 1024 * 1024,
            stale_age_secs: node.stale_age.as_secs(),
            map_size: node.map_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("./data"),
            primary_file: PathBuf::from("./primary.txt"),
            heartbeat: HeartbeatSection::default(),
            limits: LimitsSection::default(),
        }
    }
}

/// Per-connection settings handed to the accept loop
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Read timeout, re-armed for every line
    pub read_timeout: Duration,
    /// Largest accepted request body
    pub max_body: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Config::default().server_settings()
    }
}

impl Config {
    /// Parse a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration
    /// Priority: Environment variables > config file > defaults
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override fields from `TANDEM_*` variables looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("TANDEM_ADDR") {
            self.addr = value.parse().map_err(|_| ConfigError::Env {
                var: "TANDEM_ADDR",
                value,
            })?;
        }

        if let Some(value) = lookup("TANDEM_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }

        if let Some(value) = lookup("TANDEM_PRIMARY_FILE") {
            self.primary_file = PathBuf::from(value);
        }

        if let Some(value) = lookup("TANDEM_HEARTBEAT_GROUP") {
            self.heartbeat.group = value.parse().map_err(|_| ConfigError::Env {
                var: "TANDEM_HEARTBEAT_GROUP",
                value,
            })?;
        }

        if let Some(value) = lookup("TANDEM_HEARTBEAT_INTERFACE") {
            self.heartbeat.interface = value.parse().map_err(|_| ConfigError::Env {
                var: "TANDEM_HEARTBEAT_INTERFACE",
                value,
            })?;
        }

        Ok(())
    }

    /// Set a new listen address
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set a new data directory
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set a new primary descriptor path
    pub fn with_primary_file(mut self, primary_file: impl Into<PathBuf>) -> Self {
        self.primary_file = primary_file.into();
        self
    }

    /// Check values that cannot be checked one field at a time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.port() == 0 {
            return Err(ConfigError::Invalid(
                "listen port must be set explicitly".into(),
            ));
        }
        if self.limits.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "read timeout must be greater than zero".into(),
            ));
        }
        if self.heartbeat.enabled {
            self.heartbeat_config()
                .validate()
                .map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Heartbeat settings for the core
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: self.heartbeat.enabled,
            group: self.heartbeat.group,
            interface: self.heartbeat.interface,
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            deadline: Duration::from_millis(self.heartbeat.deadline_ms),
        }
    }

    /// Node settings for the core
    pub fn node_config(&self) -> NodeConfig {
        let replication = ReplicationConfig::new(self.addr.ip().to_string(), self.addr.port())
            .with_primary_file(self.primary_file.clone())
            .with_heartbeat(self.heartbeat_config());

        NodeConfig {
            storage_dir: self.data_dir.clone(),
            map_size: self.limits.map_size,
            read_limit: self.limits.read_limit,
            stale_age: Duration::from_secs(self.limits.stale_age_secs),
            replication,
        }
    }

    /// Connection settings for the accept loop
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            read_timeout: Duration::from_millis(self.limits.read_timeout_ms),
            max_body: self.limits.max_body,
        }
    }
}

//! Primary/secondary replication for Tandem
//!
//! One primary serves clients; at most one secondary mirrors its files and log.
//!
//! # Roles
//!
//! At startup a node reads the shared primary descriptor. If it is missing,
//! unparsable, or names this node, the node becomes primary. Otherwise it joins the
//! named primary as secondary:
//!
//! ```text
//! secondary                                primary
//!    │── NEW_SEC {host, port, digests} ──────►│  registers the secondary
//!    │◄──────────── SYNC_FILES [names] ───────│
//!    │── READ name (per differing file) ─────►│
//!    │◄──────────── raw bytes ────────────────│
//!    │── SYNC_LOG ───────────────────────────►│
//!    │◄──────────── SYNC_LOG {id: record} ────│  COMMIT/ABORT records only
//! ```
//!
//! Any step that cannot connect means the primary is gone and the node promotes
//! itself instead.
//!
//! # Forwarding
//!
//! Before the primary appends a commit to a file (or marks an abort) it sends
//! `SEC_COMMIT`/`SEC_ABORT` with the full record and waits for the reply. An
//! unreachable secondary is logged and the local operation proceeds; noticing a
//! dead peer is the heartbeat's job.
//!
//! # Failover
//!
//! On peer silence a secondary promotes itself and a primary forgets its
//! secondary so a new one can join.

pub mod config;
pub mod descriptor;
pub mod heartbeat;
mod primary;
mod secondary;

pub use config::ReplicationConfig;
pub use descriptor::PrimaryDescriptor;
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use secondary::JoinOutcome;

use crate::log::TxnLog;
use crate::storage::FileStore;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tandem_protocol::FileClient;
use tracing::{info, warn};

/// Node role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Startup has not decided yet
    Unset,
    /// Serving clients, optionally mirrored by one secondary
    Primary {
        /// Registered secondary, `host:port`
        secondary: Option<String>,
    },
    /// Mirroring a primary
    Secondary {
        /// Current primary, `host:port`
        primary: String,
    },
}

impl Role {
    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Role::Unset => "starting",
            Role::Primary { .. } => "primary",
            Role::Secondary { .. } => "secondary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owns the role state machine and all traffic with the peer
pub struct ReplicationManager {
    config: ReplicationConfig,
    descriptor: PrimaryDescriptor,
    role: RwLock<Role>,
    log: Arc<TxnLog>,
    files: Arc<FileStore>,
}

impl ReplicationManager {
    /// Create a manager in the `Unset` role
    pub fn new(config: ReplicationConfig, log: Arc<TxnLog>, files: Arc<FileStore>) -> Self {
        let descriptor = PrimaryDescriptor::new(&config.primary_file);
        Self {
            config,
            descriptor,
            role: RwLock::new(Role::Unset),
            log,
            files,
        }
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.role.read().clone()
    }

    /// Whether this node currently serves clients
    pub fn is_primary(&self) -> bool {
        matches!(*self.role.read(), Role::Primary { .. })
    }

    /// Fail with a redirect unless this node is primary
    pub fn check_primary(&self) -> Result<()> {
        match &*self.role.read() {
            Role::Primary { .. } => Ok(()),
            Role::Secondary { primary } => Err(Error::NotPrimary {
                primary: primary.clone(),
            }),
            Role::Unset => Err(Error::internal("Node is still starting up")),
        }
    }

    /// Decide the startup role from the descriptor and act on it
    pub async fn start(&self) -> Result<()> {
        let self_addr = self.config.self_addr();
        match self.descriptor.read() {
            Some(primary) if primary != self_addr => {
                info!(primary = %primary, "Joining primary as secondary");
                match self.join(&primary).await? {
                    JoinOutcome::Joined => Ok(()),
                    JoinOutcome::Unreachable => {
                        warn!(primary = %primary, "Primary unreachable during join; promoting");
                        self.become_primary()
                    }
                }
            }
            _ => self.become_primary(),
        }
    }

    /// Take over as primary and point the descriptor here
    pub fn become_primary(&self) -> Result<()> {
        *self.role.write() = Role::Primary { secondary: None };
        self.files.refresh()?;
        self.descriptor.write(&self.config.host, self.config.port)?;
        info!(addr = %self.config.self_addr(), "Now primary");
        Ok(())
    }

    /// React to the peer's heartbeat going silent
    pub fn on_peer_silence(&self) -> Result<()> {
        match self.role() {
            Role::Secondary { primary } => {
                warn!(primary = %primary, "Primary heartbeat lost; promoting");
                self.become_primary()
            }
            Role::Primary { .. } => {
                if let Role::Primary { secondary } = &mut *self.role.write() {
                    if let Some(addr) = secondary.take() {
                        warn!(secondary = %addr, "Secondary heartbeat lost; forgetting it");
                    }
                }
                Ok(())
            }
            Role::Unset => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_role(&self, role: Role) {
        *self.role.write() = role;
    }

    fn peer_client(&self, addr: &str) -> FileClient {
        FileClient::new(addr).with_timeouts(self.config.connect_timeout, self.config.io_timeout)
    }
}

//! Node service object
//!
//! Owns the log, file store, commit engine and replication manager, and exposes one
//! method per protocol operation. The connection layer holds an `Arc<Node>`.

use crate::log::{LOG_DIR, TxnLog};
use crate::replication::{HeartbeatMonitor, ReplicationConfig, ReplicationManager, Role};
use crate::storage::{DEFAULT_READ_LIMIT, FileStore};
use crate::transaction::{CommitEngine, CommitOutcome, CommitPlan, Transaction, TxnStatus};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::JoinRequest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Settings for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the served files and the log
    pub storage_dir: PathBuf,
    /// LMDB map size for the log
    pub map_size: usize,
    /// Bytes returned by READ
    pub read_limit: usize,
    /// Age after which an open transaction is aborted by the sweep
    pub stale_age: Duration,
    /// Peer and heartbeat settings
    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./data"),
            map_size: 1024 * 1024 * 1024,
            read_limit: DEFAULT_READ_LIMIT,
            stale_age: Duration::from_secs(5 * 60),
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Directory of the log environment and staging files
    pub fn log_dir(&self) -> PathBuf {
        self.storage_dir.join(LOG_DIR)
    }
}

/// Snapshot of a node's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// `primary`, `secondary` or `starting`
    pub role: String,
    /// This node's address
    pub addr: String,
    /// Primary followed by a secondary
    pub primary: Option<String>,
    /// Secondary registered with a primary
    pub secondary: Option<String>,
    /// Id the next NEW_TXN will get
    pub next_txn_id: i64,
    /// Number of tracked files
    pub files: usize,
}

/// One member of the primary/secondary pair
pub struct Node {
    config: NodeConfig,
    engine: CommitEngine,
    replication: Arc<ReplicationManager>,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
}

impl Node {
    /// Open storage without touching the network; the role stays unset
    pub fn open(config: NodeConfig) -> Result<Self> {
        config
            .replication
            .validate()
            .map_err(Error::config)?;

        let log_dir = config.log_dir();
        let log = Arc::new(TxnLog::open(&log_dir, config.map_size)?);
        let files = Arc::new(FileStore::open(
            &config.storage_dir,
            &log_dir,
            config.read_limit,
        )?);
        let engine = CommitEngine::new(log.clone(), files.clone());
        let replication = Arc::new(ReplicationManager::new(
            config.replication.clone(),
            log,
            files,
        ));

        Ok(Self {
            config,
            engine,
            replication,
            heartbeat: Mutex::new(None),
        })
    }

    /// Open storage, sweep stale transactions, take a role and start the heartbeat
    pub async fn start(config: NodeConfig) -> Result<Arc<Self>> {
        let node = Self::open(config)?;
        node.engine.sweep_stale(node.config.stale_age).await?;
        node.replication.start().await?;
        node.start_heartbeat()?;

        let status = node.status()?;
        info!(
            role = %status.role,
            addr = %status.addr,
            next_txn_id = status.next_txn_id,
            files = status.files,
            "Node started"
        );
        Ok(Arc::new(node))
    }

    fn start_heartbeat(&self) -> Result<()> {
        let config = &self.config.replication;
        if !config.heartbeat.enabled {
            return Ok(());
        }

        let (monitor, silence) = HeartbeatMonitor::start(&config.heartbeat, config.self_addr())?;
        spawn_failover(self.replication.clone(), silence);

        *self.heartbeat.lock() = Some(monitor);
        Ok(())
    }

    /// Stop the heartbeat, abort stale transactions and sync the log
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut monitor) = self.heartbeat.lock().take() {
            monitor.stop();
        }
        self.engine.sweep_stale(self.config.stale_age).await?;
        self.engine.log().sync()?;
        info!("Node stopped");
        Ok(())
    }

    /// Configuration
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Commit engine
    pub fn engine(&self) -> &CommitEngine {
        &self.engine
    }

    /// Replication manager
    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.replication.role()
    }

    /// Apply a peer-silence signal (what the heartbeat does on a missed deadline)
    pub fn on_peer_silence(&self) -> Result<()> {
        self.replication.on_peer_silence()
    }

    /// NEW_TXN
    pub fn new_txn(&self, file: &str) -> Result<i64> {
        self.replication.check_primary()?;
        self.engine.start_new_txn(file)
    }

    /// WRITE
    pub async fn write(&self, id: i64, seq: u64, chunk: Vec<u8>) -> Result<()> {
        self.replication.check_primary()?;
        self.engine.save_write(id, seq, chunk).await
    }

    /// COMMIT, forwarding to the secondary before the file changes
    pub async fn commit(&self, id: i64, seq: u64) -> Result<CommitOutcome> {
        self.replication.check_primary()?;
        let guard = self.engine.lock_txn(id).await;
        match self.engine.prepare_commit(&guard, seq)? {
            CommitPlan::Committed => Ok(CommitOutcome::Committed),
            CommitPlan::Resend(missing) => Ok(CommitOutcome::Resend(missing)),
            CommitPlan::Ready(txn) => {
                self.replication.forward_commit(id, seq, &txn).await;
                self.engine.apply_commit(&guard, &txn, seq).await?;
                Ok(CommitOutcome::Committed)
            }
        }
    }

    /// ABORT, forwarding to the secondary before the status changes
    pub async fn abort(&self, id: i64) -> Result<()> {
        self.replication.check_primary()?;
        let guard = self.engine.lock_txn(id).await;
        let txn = self.engine.prepare_abort(&guard)?;
        self.replication.forward_abort(id, &txn).await;
        self.engine.apply_abort(&guard)
    }

    /// READ
    pub async fn read(&self, file: &str) -> Result<Vec<u8>> {
        self.replication.check_primary()?;
        self.engine.files().read_prefix(file).await
    }

    /// NEW_SEC: register the caller as secondary, returning a JSON list of files
    pub fn new_sec(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let join: JoinRequest = serde_json::from_slice(payload)
            .map_err(|e| Error::bad_request(format!("Invalid join payload: {}", e)))?;
        let to_pull = self.replication.add_secondary(join)?;
        Ok(serde_json::to_vec(&to_pull)?)
    }

    /// SYNC_LOG: JSON map of terminal records
    pub fn sync_log(&self) -> Result<Vec<u8>> {
        self.replication.sync_log_payload()
    }

    /// SEC_COMMIT: apply a commit the primary decided (no role check)
    pub async fn sec_commit(&self, id: i64, seq: u64, payload: &[u8]) -> Result<()> {
        let record = parse_record(payload)?;
        self.engine
            .apply_forwarded(id, record, TxnStatus::Commit, seq)
            .await
    }

    /// SEC_ABORT: apply an abort the primary decided (no role check)
    pub async fn sec_abort(&self, id: i64, payload: &[u8]) -> Result<()> {
        let record = parse_record(payload)?;
        self.engine
            .apply_forwarded(id, record, TxnStatus::Abort, 0)
            .await
    }

    /// Abort open transactions older than the configured age
    pub async fn sweep_stale(&self) -> Result<Vec<i64>> {
        self.engine.sweep_stale(self.config.stale_age).await
    }

    /// Current role, peers and counters
    pub fn status(&self) -> Result<NodeStatus> {
        let role = self.replication.role();
        let (primary, secondary) = match &role {
            Role::Primary { secondary } => (None, secondary.clone()),
            Role::Secondary { primary } => (Some(primary.clone()), None),
            Role::Unset => (None, None),
        };
        Ok(NodeStatus {
            role: role.name().to_string(),
            addr: self.config.replication.self_addr(),
            primary,
            secondary,
            next_txn_id: self.engine.log().next_id()?,
            files: self.engine.files().digests().len(),
        })
    }
}

/// Run the silence handler for every signal until the heartbeat goes away
fn spawn_failover(
    replication: Arc<ReplicationManager>,
    mut silence: mpsc::UnboundedReceiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while silence.recv().await.is_some() {
            if let Err(e) = replication.on_peer_silence() {
                error!(error = %e, "Failover handling failed");
            }
        }
    })
}

fn parse_record(payload: &[u8]) -> Result<Transaction> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::bad_request(format!("Invalid transaction record: {}", e)))
}

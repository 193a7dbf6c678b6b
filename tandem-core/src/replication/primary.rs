//! Primary side: accepting a secondary, serving its log sync, forwarding decisions

use super::{ReplicationManager, Role};
use crate::transaction::Transaction;
use crate::{Error, Result};
use tandem_protocol::{JoinRequest, diff_files};
use tracing::{debug, info, warn};

impl ReplicationManager {
    /// Register a joining secondary and list the files it has to pull
    pub fn add_secondary(&self, join: JoinRequest) -> Result<Vec<String>> {
        let addr = join.addr();
        {
            let mut role = self.role.write();
            match &mut *role {
                Role::Primary { secondary } => {
                    if let Some(previous) = secondary.replace(addr.clone()) {
                        if previous != addr {
                            warn!(previous = %previous, "Replacing registered secondary");
                        }
                    }
                }
                Role::Secondary { primary } => {
                    return Err(Error::NotPrimary {
                        primary: primary.clone(),
                    });
                }
                Role::Unset => return Err(Error::internal("Node is still starting up")),
            }
        }

        let to_pull = diff_files(&self.files.digests(), &join.files);
        info!(secondary = %addr, files = to_pull.len(), "Secondary joined");
        Ok(to_pull)
    }

    /// Registered secondary, if any
    pub fn secondary(&self) -> Option<String> {
        match &*self.role.read() {
            Role::Primary { secondary } => secondary.clone(),
            _ => None,
        }
    }

    /// JSON map of every committed or aborted record
    pub fn sync_log_payload(&self) -> Result<Vec<u8>> {
        self.check_primary()?;
        let records = self.log.terminal_records()?;
        debug!(records = records.len(), "Serving log sync");
        Ok(serde_json::to_vec(&records)?)
    }

    /// Send a commit decision to the secondary before applying it locally
    pub async fn forward_commit(&self, id: i64, seq: u64, txn: &Transaction) {
        let Some(secondary) = self.secondary() else {
            return;
        };
        match self.peer_client(&secondary).sec_commit(id, seq, txn).await {
            Ok(()) => debug!(txn_id = id, secondary = %secondary, "Commit forwarded"),
            Err(e) => warn!(
                txn_id = id,
                secondary = %secondary,
                error = %e,
                "Forwarding commit failed; committing locally"
            ),
        }
    }

    /// Send an abort decision to the secondary before applying it locally
    pub async fn forward_abort(&self, id: i64, txn: &Transaction) {
        let Some(secondary) = self.secondary() else {
            return;
        };
        match self.peer_client(&secondary).sec_abort(id, txn).await {
            Ok(()) => debug!(txn_id = id, secondary = %secondary, "Abort forwarded"),
            Err(e) => warn!(
                txn_id = id,
                secondary = %secondary,
                error = %e,
                "Forwarding abort failed; aborting locally"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ReplicationConfig;
    use super::super::tests::manager;
    use super::*;
    use crate::transaction::TxnStatus;
    use std::collections::BTreeMap;
    use tandem_protocol::FileDigests;
    use tempfile::TempDir;

    fn primary(dir: &TempDir) -> ReplicationManager {
        let config = ReplicationConfig::new("127.0.0.1", 7101)
            .with_primary_file(dir.path().join("primary.txt"))
            .without_heartbeat();
        let manager = manager(dir, config);
        manager.become_primary().unwrap();
        manager
    }

    #[tokio::test]
    async fn test_add_secondary_returns_diff() {
        let dir = TempDir::new().unwrap();
        let manager = primary(&dir);
        manager.files.append("a.txt", b"a".to_vec()).await.unwrap();
        manager.files.append("b.txt", b"b".to_vec()).await.unwrap();

        let mut files = FileDigests::new();
        files.insert("a.txt".into(), manager.files.digests()["a.txt"].clone());
        files.insert("b.txt".into(), "stale".into());

        let to_pull = manager
            .add_secondary(JoinRequest {
                host: "127.0.0.1".into(),
                port: 7102,
                files,
            })
            .unwrap();
        assert_eq!(to_pull, vec!["b.txt"]);
        assert_eq!(manager.secondary().as_deref(), Some("127.0.0.1:7102"));
    }

    #[test]
    fn test_secondary_refuses_join() {
        let dir = TempDir::new().unwrap();
        let manager = primary(&dir);
        *manager.role.write() = Role::Secondary {
            primary: "127.0.0.1:7100".into(),
        };

        let err = manager
            .add_secondary(JoinRequest {
                host: "127.0.0.1".into(),
                port: 7102,
                files: FileDigests::new(),
            })
            .unwrap_err();
        assert_eq!(err.code().as_u16(), 207);
    }

    #[test]
    fn test_sync_log_payload_has_terminal_records_only() {
        let dir = TempDir::new().unwrap();
        let manager = primary(&dir);

        manager.log.allocate(&Transaction::new("open.txt")).unwrap();
        let done = manager.log.allocate(&Transaction::new("done.txt")).unwrap();
        manager
            .log
            .update(done, |txn| {
                txn.status = TxnStatus::Abort;
                Ok(())
            })
            .unwrap();

        let payload = manager.sync_log_payload().unwrap();
        let records: BTreeMap<i64, Transaction> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(records.keys().copied().collect::<Vec<_>>(), vec![done]);
        assert_eq!(records[&done].status, TxnStatus::Abort);
    }

    #[tokio::test]
    async fn test_forward_to_dead_secondary_returns() {
        let dir = TempDir::new().unwrap();
        let manager = primary(&dir);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        manager
            .add_secondary(JoinRequest {
                host: "127.0.0.1".into(),
                port,
                files: FileDigests::new(),
            })
            .unwrap();

        // Must not fail or hang; the caller proceeds locally
        manager
            .forward_commit(1, 1, &Transaction::new("f.txt"))
            .await;
        manager.forward_abort(1, &Transaction::new("f.txt")).await;
        assert!(manager.secondary().is_some());
    }
}

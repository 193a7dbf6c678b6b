use super::{MAX_RESEND_LIST, Transaction, TxnStatus};
use crate::log::TxnLog;
use crate::storage::{FileStore, KeyGuard, LockTable};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a COMMIT has to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitPlan {
    /// Already committed; nothing to do
    Committed,
    /// These chunks are missing; the client must send them and commit again
    Resend(Vec<u64>),
    /// Complete: the file can be updated with this record's chunks
    Ready(Transaction),
}

/// Result of a COMMIT as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction is committed
    Committed,
    /// These chunks have to be sent before committing again
    Resend(Vec<u64>),
}

/// Exclusive hold on one transaction id
pub struct TxnGuard {
    id: i64,
    _guard: KeyGuard,
}

impl TxnGuard {
    /// Locked transaction id
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Validates and applies transaction operations against the log and file store.
///
/// Operations on one transaction id are serialized by a per-id lock; file content
/// is serialized by a per-filename lock held only while the file is rewritten.
/// A COMMIT is split into [`prepare_commit`](Self::prepare_commit) and
/// [`apply_commit`](Self::apply_commit) so the caller can forward the decision to a
/// peer in between.
pub struct CommitEngine {
    log: Arc<TxnLog>,
    files: Arc<FileStore>,
    txn_locks: LockTable<i64>,
    file_locks: LockTable<String>,
}

impl CommitEngine {
    /// Create an engine over an open log and file store
    pub fn new(log: Arc<TxnLog>, files: Arc<FileStore>) -> Self {
        Self {
            log,
            files,
            txn_locks: LockTable::new(),
            file_locks: LockTable::new(),
        }
    }

    /// Transaction log
    pub fn log(&self) -> &Arc<TxnLog> {
        &self.log
    }

    /// File store
    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    /// Open a transaction on `file`
    pub fn start_new_txn(&self, file: &str) -> Result<i64> {
        self.files.validate_new_name(file)?;
        let id = self.log.allocate(&Transaction::new(file))?;
        info!(txn_id = id, file, "Transaction started");
        Ok(id)
    }

    /// Store chunk `seq` of transaction `id`
    pub async fn save_write(&self, id: i64, seq: u64, buf: Vec<u8>) -> Result<()> {
        let _guard = self.lock_txn(id).await;
        let len = buf.len();
        self.log.update(id, |txn| {
            match txn.status {
                TxnStatus::Abort => {
                    return Err(Error::invalid_operation("Transaction has been aborted."));
                }
                TxnStatus::Commit => {
                    return Err(Error::invalid_operation(
                        "Transaction has been committed already.",
                    ));
                }
                TxnStatus::NewTxn => {}
            }
            txn.writes.insert(seq, buf);
            Ok(())
        })?;
        debug!(txn_id = id, seq, bytes = len, "Chunk stored");
        Ok(())
    }

    /// Take the per-transaction lock
    pub async fn lock_txn(&self, id: i64) -> TxnGuard {
        TxnGuard {
            id,
            _guard: self.txn_locks.lock(&id).await,
        }
    }

    /// Decide what COMMIT(`seq`) on a locked transaction needs.
    ///
    /// A resend plan names at most [`MAX_RESEND_LIST`] chunks; the client commits
    /// again after sending them and learns about the rest then.
    pub fn prepare_commit(&self, guard: &TxnGuard, seq: u64) -> Result<CommitPlan> {
        let id = guard.id();
        let txn = self.log.get(id)?.ok_or(Error::UnknownTransaction(id))?;

        match txn.status {
            TxnStatus::Abort => Err(Error::invalid_operation(
                "Transaction has been aborted already.",
            )),
            TxnStatus::Commit => Ok(CommitPlan::Committed),
            TxnStatus::NewTxn => {
                let missing = txn.missing_chunks(seq, MAX_RESEND_LIST);
                if missing.is_empty() {
                    Ok(CommitPlan::Ready(txn))
                } else {
                    debug!(txn_id = id, ?missing, "Commit is missing chunks");
                    Ok(CommitPlan::Resend(missing))
                }
            }
        }
    }

    /// Append the chunks to the target file, then mark the record committed.
    ///
    /// On a file error the record keeps its status so the client can retry.
    pub async fn apply_commit(&self, guard: &TxnGuard, txn: &Transaction, seq: u64) -> Result<()> {
        let id = guard.id();
        {
            let _file = self.file_locks.lock(&txn.file).await;
            self.files.append(&txn.file, txn.assemble(seq)).await?;
        }

        self.log.update(id, |record| {
            record.status = TxnStatus::Commit;
            record.writes_committed = seq as i64 - 1;
            Ok(())
        })?;
        info!(txn_id = id, file = %txn.file, chunks = seq, "Transaction committed");
        Ok(())
    }

    /// Check that ABORT is allowed on a locked transaction, returning the record
    pub fn prepare_abort(&self, guard: &TxnGuard) -> Result<Transaction> {
        let id = guard.id();
        let txn = self.log.get(id)?.ok_or(Error::UnknownTransaction(id))?;
        if txn.status == TxnStatus::Commit {
            return Err(Error::invalid_operation(
                "Transaction has been committed already.",
            ));
        }
        Ok(txn)
    }

    /// Mark a locked transaction aborted
    pub fn apply_abort(&self, guard: &TxnGuard) -> Result<()> {
        let id = guard.id();
        self.log.update(id, |txn| {
            if txn.status == TxnStatus::Commit {
                return Err(Error::invalid_operation(
                    "Transaction has been committed already.",
                ));
            }
            txn.status = TxnStatus::Abort;
            Ok(())
        })?;
        info!(txn_id = id, "Transaction aborted");
        Ok(())
    }

    /// Full COMMIT without forwarding
    pub async fn commit_txn(&self, id: i64, seq: u64) -> Result<CommitOutcome> {
        let guard = self.lock_txn(id).await;
        match self.prepare_commit(&guard, seq)? {
            CommitPlan::Committed => Ok(CommitOutcome::Committed),
            CommitPlan::Resend(missing) => Ok(CommitOutcome::Resend(missing)),
            CommitPlan::Ready(txn) => {
                self.apply_commit(&guard, &txn, seq).await?;
                Ok(CommitOutcome::Committed)
            }
        }
    }

    /// Full ABORT without forwarding
    pub async fn abort_txn(&self, id: i64) -> Result<()> {
        let guard = self.lock_txn(id).await;
        self.prepare_abort(&guard)?;
        self.apply_abort(&guard)
    }

    /// Install a record received from the primary, then run the matching path.
    ///
    /// A record that is already terminal locally is left alone.
    pub async fn apply_forwarded(
        &self,
        id: i64,
        record: Transaction,
        decision: TxnStatus,
        seq: u64,
    ) -> Result<()> {
        let guard = self.lock_txn(id).await;

        if let Some(local) = self.log.get(id)? {
            if local.status.is_terminal() {
                debug!(txn_id = id, status = ?local.status, "Forwarded decision already applied");
                return Ok(());
            }
        }

        let mut record = record;
        record.status = TxnStatus::NewTxn;
        self.log.put(id, &record)?;
        self.log.bump_next_id(id)?;

        match decision {
            TxnStatus::Commit => match self.prepare_commit(&guard, seq)? {
                CommitPlan::Ready(txn) => self.apply_commit(&guard, &txn, seq).await,
                CommitPlan::Committed => Ok(()),
                CommitPlan::Resend(missing) => Err(Error::peer(format!(
                    "Forwarded commit of transaction {} is missing chunks {:?}",
                    id, missing
                ))),
            },
            TxnStatus::Abort => {
                self.prepare_abort(&guard)?;
                self.apply_abort(&guard)
            }
            TxnStatus::NewTxn => Err(Error::bad_request(
                "Forwarded decision must be a commit or an abort",
            )),
        }
    }

    /// Abort every open transaction older than `max_age`, returning their ids
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<Vec<i64>> {
        let now = chrono::Utc::now().timestamp_millis();
        let stale: Vec<i64> = self
            .log
            .records()?
            .into_iter()
            .filter(|(_, txn)| txn.is_stale(max_age, now))
            .map(|(id, _)| id)
            .collect();

        let mut aborted = Vec::new();
        for id in stale {
            let guard = self.lock_txn(id).await;
            // Re-check under the lock; a commit may have won the race
            match self.log.get(id)? {
                Some(txn) if txn.is_stale(max_age, now) => {
                    self.apply_abort(&guard)?;
                    aborted.push(id);
                }
                _ => {}
            }
        }

        if !aborted.is_empty() {
            warn!(count = aborted.len(), ids = ?aborted, "Aborted stale transactions");
        }
        Ok(aborted)
    }
}

//! Durable transaction log
//!
//! One LMDB environment per node holding:
//! - `transactions`: txn id (decimal string) → [`Transaction`]
//! - `meta`: the next unused id under [`NEXT_ID_KEY`]
//!
//! Every mutation commits its write transaction and then forces an fsync of the
//! environment before returning.

use crate::transaction::{Transaction, TxnStatus};
use crate::{Error, Result};
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Directory under the storage root holding the log environment
pub const LOG_DIR: &str = ".server_log";

/// Key of the id counter in the `meta` database
pub const NEXT_ID_KEY: &str = "next_id";

/// First id handed out on a fresh log
pub const FIRST_TXN_ID: i64 = 1;

/// Transaction log backed by LMDB
pub struct TxnLog {
    env: Env,
    records: Database<Str, SerdeBincode<Transaction>>,
    meta: Database<Str, SerdeBincode<i64>>,
}

impl TxnLog {
    /// Open (or create) the log environment in `path`
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let records = env.create_database(&mut wtxn, Some("transactions"))?;
        let meta: Database<Str, SerdeBincode<i64>> =
            env.create_database(&mut wtxn, Some("meta"))?;
        if meta.get(&wtxn, NEXT_ID_KEY)?.is_none() {
            meta.put(&mut wtxn, NEXT_ID_KEY, &FIRST_TXN_ID)?;
        }
        wtxn.commit()?;
        env.force_sync()?;

        Ok(Self { env, records, meta })
    }

    /// Store `txn` under the next id and advance the counter, atomically
    pub fn allocate(&self, txn: &Transaction) -> Result<i64> {
        let mut wtxn = self.env.write_txn()?;
        let id = self.meta.get(&wtxn, NEXT_ID_KEY)?.unwrap_or(FIRST_TXN_ID);
        self.records.put(&mut wtxn, &id.to_string(), txn)?;
        self.meta.put(&mut wtxn, NEXT_ID_KEY, &(id + 1))?;
        self.commit(wtxn)?;

        debug!(txn_id = id, file = %txn.file, "Transaction allocated");
        Ok(id)
    }

    /// Fetch a record
    pub fn get(&self, id: i64) -> Result<Option<Transaction>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.records.get(&rtxn, &id.to_string())?)
    }

    /// Insert or overwrite a record
    pub fn put(&self, id: i64, txn: &Transaction) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.records.put(&mut wtxn, &id.to_string(), txn)?;
        self.commit(wtxn)?;

        debug!(txn_id = id, status = ?txn.status, "Transaction stored");
        Ok(())
    }

    /// Read-modify-write a record inside one write transaction.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<F>(&self, id: i64, f: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut wtxn = self.env.write_txn()?;
        let key = id.to_string();
        let mut txn = self
            .records
            .get(&wtxn, &key)?
            .ok_or(Error::UnknownTransaction(id))?;
        f(&mut txn)?;
        self.records.put(&mut wtxn, &key, &txn)?;
        self.commit(wtxn)?;

        debug!(txn_id = id, status = ?txn.status, "Transaction updated");
        Ok(txn)
    }

    /// Delete a record, returning whether it existed
    pub fn remove(&self, id: i64) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let existed = self.records.delete(&mut wtxn, &id.to_string())?;
        self.commit(wtxn)?;
        Ok(existed)
    }

    /// The id the next `allocate` will hand out
    pub fn next_id(&self) -> Result<i64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.meta.get(&rtxn, NEXT_ID_KEY)?.unwrap_or(FIRST_TXN_ID))
    }

    /// Raise the counter past `seen` so it is never handed out again
    pub fn bump_next_id(&self, seen: i64) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        let current = self.meta.get(&wtxn, NEXT_ID_KEY)?.unwrap_or(FIRST_TXN_ID);
        if seen + 1 > current {
            self.meta.put(&mut wtxn, NEXT_ID_KEY, &(seen + 1))?;
            self.commit(wtxn)?;
        }
        Ok(())
    }

    /// All records, ordered by id
    pub fn records(&self) -> Result<BTreeMap<i64, Transaction>> {
        let rtxn = self.env.read_txn()?;
        let mut out = BTreeMap::new();
        for item in self.records.iter(&rtxn)? {
            let (key, txn) = item?;
            match key.parse::<i64>() {
                Ok(id) => {
                    out.insert(id, txn);
                }
                Err(_) => warn!(key, "Skipping log record with a non-numeric key"),
            }
        }
        Ok(out)
    }

    /// Committed and aborted records, ordered by id
    pub fn terminal_records(&self) -> Result<BTreeMap<i64, Transaction>> {
        let mut records = self.records()?;
        records.retain(|_, txn| txn.status.is_terminal());
        Ok(records)
    }

    /// Drop every `NEW_TXN` record, returning how many were removed
    pub fn discard_pending(&self) -> Result<usize> {
        let pending: Vec<i64> = self
            .records()?
            .into_iter()
            .filter(|(_, txn)| txn.status == TxnStatus::NewTxn)
            .map(|(id, _)| id)
            .collect();

        let mut wtxn = self.env.write_txn()?;
        for id in &pending {
            self.records.delete(&mut wtxn, &id.to_string())?;
        }
        self.commit(wtxn)?;
        Ok(pending.len())
    }

    /// Force the environment to stable storage
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    fn commit(&self, wtxn: RwTxn<'_>) -> Result<()> {
        wtxn.commit()?;
        self.env.force_sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAP_SIZE: usize = 10 * 1024 * 1024;

    fn open(dir: &TempDir) -> TxnLog {
        TxnLog::open(dir.path().join(LOG_DIR), MAP_SIZE).unwrap()
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);

        assert_eq!(log.next_id().unwrap(), 1);
        let a = log.allocate(&Transaction::new("a.txt")).unwrap();
        let b = log.allocate(&Transaction::new("b.txt")).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.get(a).unwrap().unwrap().file, "a.txt");
        assert!(log.get(99).unwrap().is_none());
    }

    #[test]
    fn test_counter_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = open(&dir);
            log.allocate(&Transaction::new("a.txt")).unwrap();
            log.allocate(&Transaction::new("a.txt")).unwrap();
        }
        let log = open(&dir);
        assert_eq!(log.next_id().unwrap(), 3);
        assert_eq!(log.records().unwrap().len(), 2);
    }

    #[test]
    fn test_update_is_atomic_on_failure() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);
        let id = log.allocate(&Transaction::new("a.txt")).unwrap();

        let result = log.update(id, |txn| {
            txn.status = TxnStatus::Abort;
            Err(Error::internal("refused"))
        });
        assert!(result.is_err());
        assert_eq!(log.get(id).unwrap().unwrap().status, TxnStatus::NewTxn);

        assert!(matches!(
            log.update(42, |_| Ok(())),
            Err(Error::UnknownTransaction(42))
        ));
    }

    #[test]
    fn test_terminal_records_and_discard_pending() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);

        let open_id = log.allocate(&Transaction::new("a.txt")).unwrap();
        let done_id = log.allocate(&Transaction::new("b.txt")).unwrap();
        log.update(done_id, |txn| {
            txn.status = TxnStatus::Commit;
            Ok(())
        })
        .unwrap();

        let terminal = log.terminal_records().unwrap();
        assert_eq!(terminal.keys().copied().collect::<Vec<_>>(), vec![done_id]);

        assert_eq!(log.discard_pending().unwrap(), 1);
        assert!(log.get(open_id).unwrap().is_none());
        assert!(log.get(done_id).unwrap().is_some());
        // The counter is untouched by the discard
        assert_eq!(log.next_id().unwrap(), 3);
    }

    #[test]
    fn test_bump_next_id() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir);

        log.bump_next_id(10).unwrap();
        assert_eq!(log.next_id().unwrap(), 11);
        // Never moves backwards
        log.bump_next_id(4).unwrap();
        assert_eq!(log.next_id().unwrap(), 11);
    }
}

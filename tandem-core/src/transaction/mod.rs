//! Transaction layer - records and the commit engine
//!
//! A transaction targets one file and collects numbered chunks:
//! - `NEW_TXN` opens it, `WRITE` stores chunk `seq` (overwrites allowed)
//! - `COMMIT(seq)` needs every chunk in `0..seq`, appends them in order, then
//!   flips the status
//! - `ABORT` flips the status without touching the file
//!
//! `COMMIT` and `ABORT` are terminal; a terminal record never changes again.

mod engine;

pub use engine::{CommitEngine, CommitOutcome, CommitPlan, TxnGuard};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Most sequence numbers a single ASK_RESEND reply lists
pub const MAX_RESEND_LIST: usize = 1024;

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnStatus {
    /// Open, accepting writes
    NewTxn,
    /// Committed (terminal)
    Commit,
    /// Aborted (terminal)
    Abort,
}

impl TxnStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxnStatus::NewTxn)
    }
}

/// Durable transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Target filename, fixed at creation
    pub file: String,
    /// Current status
    pub status: TxnStatus,
    /// Chunks by sequence number
    #[serde(with = "chunk_map")]
    pub writes: BTreeMap<u64, Vec<u8>>,
    /// Last committed sequence number (`seq - 1`), -1 until committed
    pub writes_committed: i64,
    /// Creation time, unix milliseconds
    pub start_time: i64,
}

impl Transaction {
    /// Fresh `NEW_TXN` record for `file`
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            status: TxnStatus::NewTxn,
            writes: BTreeMap::new(),
            writes_committed: -1,
            start_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The first `limit` sequence numbers in `0..seq` that were never written
    pub fn missing_chunks(&self, seq: u64, limit: usize) -> Vec<u64> {
        (0..seq)
            .filter(|k| !self.writes.contains_key(k))
            .take(limit)
            .collect()
    }

    /// Chunks `0..seq` concatenated in numeric order
    pub fn assemble(&self, seq: u64) -> Vec<u8> {
        let mut data = Vec::new();
        for (_, chunk) in self.writes.range(..seq) {
            data.extend_from_slice(chunk);
        }
        data
    }

    /// Whether an open transaction has outlived `max_age` at `now_ms`
    pub fn is_stale(&self, max_age: Duration, now_ms: i64) -> bool {
        self.status == TxnStatus::NewTxn
            && now_ms.saturating_sub(self.start_time) > max_age.as_millis() as i64
    }
}

/// Chunk bytes as base64 strings in text formats (the JSON sent to the peer) and as
/// plain byte sequences in binary ones (the LMDB log)
mod chunk_map {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        writes: &BTreeMap<u64, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_map(
                writes
                    .iter()
                    .map(|(seq, chunk)| (seq, STANDARD.encode(chunk))),
            )
        } else {
            writes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, Vec<u8>>, D::Error> {
        if deserializer.is_human_readable() {
            BTreeMap::<u64, String>::deserialize(deserializer)?
                .into_iter()
                .map(|(seq, text)| {
                    STANDARD
                        .decode(text)
                        .map(|chunk| (seq, chunk))
                        .map_err(|e| D::Error::custom(format!("chunk {}: {}", seq, e)))
                })
                .collect()
        } else {
            BTreeMap::deserialize(deserializer)
        }
    }
}

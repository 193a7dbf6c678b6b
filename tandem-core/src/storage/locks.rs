//! Keyed async mutexes
//!
//! Waiters on the same key are served in arrival order (tokio's mutex is FIFO),
//! so a busy file cannot starve a queued commit.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Idle entries are pruned once the table grows past this size
const PRUNE_THRESHOLD: usize = 1024;

/// Guard returned by [`LockTable::lock`]
pub type KeyGuard = OwnedMutexGuard<()>;

/// One async mutex per key, created on first use
pub struct LockTable<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    /// Empty table
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            if locks.len() > PRUNE_THRESHOLD {
                // Only the table holds a reference: nobody owns or waits on it
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for LockTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

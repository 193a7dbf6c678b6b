//! Secondary side: the three-step join against a primary

use super::{ReplicationManager, Role};
use crate::transaction::Transaction;
use crate::{Error, Result};
use std::collections::BTreeMap;
use tandem_protocol::{ClientResult, JoinRequest};
use tracing::{info, warn};

/// How a join attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Files and log are in sync; the node is now secondary
    Joined,
    /// The primary could not be reached at some step
    Unreachable,
}

impl ReplicationManager {
    /// Join `primary`: register, pull differing files, merge terminal log records.
    ///
    /// A peer that answers with an error fails the join; a peer that cannot be
    /// reached yields [`JoinOutcome::Unreachable`].
    pub async fn join(&self, primary: &str) -> Result<JoinOutcome> {
        let discarded = self.log.discard_pending()?;
        if discarded > 0 {
            info!(count = discarded, "Discarded open transactions before joining");
        }
        self.files.refresh()?;

        let client = self.peer_client(primary);
        let request = JoinRequest {
            host: self.config.host.clone(),
            port: self.config.port,
            files: self.files.digests(),
        };

        let Some(to_pull) = step(client.join(&request).await, "NEW_SEC")? else {
            return Ok(JoinOutcome::Unreachable);
        };

        for name in &to_pull {
            let Some(bytes) = step(client.read(name).await, "READ")? else {
                return Ok(JoinOutcome::Unreachable);
            };
            if self.files.fills_read_limit(bytes.len()) {
                warn!(
                    file = %name,
                    limit = self.files.read_limit(),
                    "Pulled file fills the READ limit; the local copy may be truncated"
                );
            }
            self.files.replace(name, bytes).await?;
        }

        let Some(records) = step(
            client.sync_log::<BTreeMap<i64, Transaction>>().await,
            "SYNC_LOG",
        )?
        else {
            return Ok(JoinOutcome::Unreachable);
        };

        for (id, record) in &records {
            if !record.status.is_terminal() {
                continue;
            }
            self.log.put(*id, record)?;
            self.log.bump_next_id(*id)?;
        }

        *self.role.write() = Role::Secondary {
            primary: primary.to_string(),
        };
        info!(
            primary = %primary,
            files = to_pull.len(),
            records = records.len(),
            "Joined as secondary"
        );
        Ok(JoinOutcome::Joined)
    }
}

/// `Ok(None)` when the peer was unreachable, an error when it answered badly
fn step<T>(result: ClientResult<T>, what: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_connect() => {
            warn!(step = what, error = %e, "Primary unreachable");
            Ok(None)
        }
        Err(e) => Err(Error::peer(format!("{} failed: {}", what, e))),
    }
}

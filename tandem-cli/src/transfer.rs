//! Whole-file transfers built from the raw operations
//!
//! `put` opens a transaction, writes the file in numbered chunks and commits,
//! resending whatever the server reports missing. Both `put` and `get` follow a
//! wrong-role redirect once.

use serde::Serialize;
use tandem_protocol::{ClientError, ClientResult, CommitReply, FileClient};
use tracing::{debug, info};

/// Default chunk size for `put`
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Commit attempts before giving up on a transaction that keeps missing chunks
pub const MAX_COMMIT_ATTEMPTS: usize = 4;

/// Summary of a finished `put`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PutReport {
    /// Server that accepted the transaction
    pub server: String,
    /// Transaction id
    pub txn: i64,
    /// Chunks written
    pub chunks: u64,
    /// Chunks written again after ASK_RESEND
    pub resent: u64,
    /// Bytes committed
    pub bytes: usize,
}

/// Runs `op` against `client`, and once more against the primary if the server
/// answers with a redirect
pub async fn with_redirect<T, F, Fut>(client: FileClient, op: F) -> ClientResult<(FileClient, T)>
where
    F: Fn(FileClient) -> Fut,
    Fut: std::future::Future<Output = ClientResult<T>>,
{
    match op(client.clone()).await {
        Ok(value) => Ok((client, value)),
        Err(e) => {
            let Some(primary) = e.redirect().map(str::to_string) else {
                return Err(e);
            };
            info!(from = %client.addr(), to = %primary, "Redirected to primary");
            let client = client.with_addr(primary);
            let value = op(client.clone()).await?;
            Ok((client, value))
        }
    }
}

/// Store `data` as a new commit to `name`
///
/// `on_chunk` is called with the size of every chunk written, resends included.
pub async fn put<P>(
    client: FileClient,
    name: &str,
    data: &[u8],
    chunk_size: usize,
    mut on_chunk: P,
) -> ClientResult<PutReport>
where
    P: FnMut(usize),
{
    if chunk_size == 0 {
        return Err(ClientError::Unexpected("chunk size must be positive".into()));
    }

    let name_owned = name.to_string();
    let (client, txn) = with_redirect(client, |c| {
        let name = name_owned.clone();
        async move { c.new_txn(&name).await }
    })
    .await?;
    debug!(server = %client.addr(), txn_id = txn, "Transaction opened");

    let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
    let count = chunks.len() as u64;
    for (seq, chunk) in chunks.iter().enumerate() {
        client.write(txn, seq as u64, chunk).await?;
        on_chunk(chunk.len());
    }

    let mut resent = 0;
    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        match client.commit(txn, count).await? {
            CommitReply::Ack => {
                return Ok(PutReport {
                    server: client.addr().to_string(),
                    txn,
                    chunks: count,
                    resent,
                    bytes: data.len(),
                });
            }
            CommitReply::Resend(missing) => {
                debug!(txn_id = txn, attempt, missing = ?missing, "Resending chunks");
                for seq in missing {
                    let chunk = chunks.get(seq as usize).ok_or_else(|| {
                        ClientError::Unexpected(format!("server asked for unknown chunk {}", seq))
                    })?;
                    client.write(txn, seq, chunk).await?;
                    on_chunk(chunk.len());
                    resent += 1;
                }
            }
        }
    }

    Err(ClientError::Unexpected(format!(
        "transaction {} still incomplete after {} commit attempts",
        txn, MAX_COMMIT_ATTEMPTS
    )))
}

/// Fetch the readable prefix of `name`
pub async fn get(client: FileClient, name: &str) -> ClientResult<Vec<u8>> {
    let name = name.to_string();
    let (_, bytes) = with_redirect(client, |c| {
        let name = name.clone();
        async move { c.read(&name).await }
    })
    .await?;
    Ok(bytes)
}

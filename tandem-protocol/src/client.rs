//! Use-once TCP client
//!
//! Every call opens a fresh connection, writes one request and reads the reply until
//! the server closes. The same client serves the CLI and the secondary's join/forward
//! traffic.

use crate::error::ProtocolError;
use crate::frame::{Method, Reply, Request, decode_replies};
use crate::sync::JoinRequest;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Result type for client calls
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Failures seen by a client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server could not be reached at all
    #[error("Cannot connect to {addr}: {source}")]
    Connect {
        /// Address dialled
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// I/O failure after the connection was established
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the I/O timeout
    #[error("Timed out waiting for {0}")]
    TimedOut(String),

    /// The server answered with an `ERROR` frame
    #[error("Server error {code}: {reason}")]
    Server {
        /// Numeric error code
        code: u16,
        /// Reason text
        reason: String,
    },

    /// The reply could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A JSON payload could not be encoded or decoded
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The reply was well-formed but not what the call expects
    #[error("Unexpected reply: {0}")]
    Unexpected(String),
}

impl ClientError {
    /// Whether the peer was unreachable (as opposed to answering badly)
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    /// For a wrong-role error, the primary address named in the reason
    pub fn redirect(&self) -> Option<&str> {
        match self {
            Self::Server { code: 207, reason } => reason
                .rsplit(' ')
                .next()
                .filter(|addr| addr.contains(':')),
            _ => None,
        }
    }
}

/// Outcome of a `COMMIT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReply {
    /// Committed (or already committed)
    Ack,
    /// These chunks have to be written before committing again
    Resend(Vec<u64>),
}

/// Client for one server address
#[derive(Debug, Clone)]
pub struct FileClient {
    addr: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl FileClient {
    /// Create a client with 3s connect and 10s I/O timeouts
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(3),
            io_timeout: Duration::from_secs(10),
        }
    }

    /// Override both timeouts
    pub fn with_timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }

    /// Same timeouts, different server
    pub fn with_addr(&self, addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..self.clone()
        }
    }

    /// Server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect and I/O timeouts
    pub fn timeouts(&self) -> (Duration, Duration) {
        (self.connect_timeout, self.io_timeout)
    }

    /// Open a transaction on `file`, returning its id
    pub async fn new_txn(&self, file: &str) -> ClientResult<i64> {
        let request = Request::new(Method::NewTxn, 0, 0, file.as_bytes().to_vec());
        match self.single(&request).await? {
            Reply::Ack { txn } => Ok(txn),
            other => Err(unexpected(&other)),
        }
    }

    /// Store chunk `seq`; success is an empty reply
    pub async fn write(&self, txn: i64, seq: u64, chunk: &[u8]) -> ClientResult<()> {
        let request = Request::new(Method::Write, txn, seq, chunk.to_vec());
        let replies = self.call(&request).await?;
        match replies.first() {
            None | Some(Reply::Ack { .. }) => Ok(()),
            Some(other) => Err(unexpected(other)),
        }
    }

    /// Commit chunks `0..seq`
    pub async fn commit(&self, txn: i64, seq: u64) -> ClientResult<CommitReply> {
        let request = Request::new(Method::Commit, txn, seq, Vec::new());
        let replies = self.call(&request).await?;

        let mut missing = Vec::new();
        for reply in &replies {
            match reply {
                Reply::Ack { .. } => return Ok(CommitReply::Ack),
                Reply::AskResend { seq, .. } => missing.push(*seq),
                other => return Err(unexpected(other)),
            }
        }
        if missing.is_empty() {
            return Err(ClientError::Unexpected("empty COMMIT reply".into()));
        }
        Ok(CommitReply::Resend(missing))
    }

    /// Abort a transaction
    pub async fn abort(&self, txn: i64) -> ClientResult<()> {
        let request = Request::new(Method::Abort, txn, 0, Vec::new());
        match self.single(&request).await? {
            Reply::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch the first bytes of `file`
    pub async fn read(&self, file: &str) -> ClientResult<Vec<u8>> {
        let request = Request::new(Method::Read, 0, 0, file.as_bytes().to_vec());
        let bytes = self.exchange(&request).await?;

        // Content is raw; only a lone ERROR frame means failure
        if bytes.starts_with(b"ERROR ") {
            if let Ok(replies) = decode_replies(&bytes) {
                if let [Reply::Error { code, reason, .. }] = replies.as_slice() {
                    return Err(ClientError::Server {
                        code: *code,
                        reason: reason.clone(),
                    });
                }
            }
        }
        Ok(bytes)
    }

    /// `NEW_SEC`: register as secondary, returning the files to pull
    pub async fn join(&self, join: &JoinRequest) -> ClientResult<Vec<String>> {
        let request = Request::new(Method::NewSec, 0, 0, serde_json::to_vec(join)?);
        match self.single(&request).await? {
            Reply::SyncFiles(payload) => Ok(serde_json::from_slice(&payload)?),
            other => Err(unexpected(&other)),
        }
    }

    /// `SYNC_LOG`: fetch the primary's terminal records
    pub async fn sync_log<T: DeserializeOwned>(&self) -> ClientResult<T> {
        let request = Request::new(Method::SyncLog, 0, 0, Vec::new());
        match self.single(&request).await? {
            Reply::SyncLog(payload) => Ok(serde_json::from_slice(&payload)?),
            other => Err(unexpected(&other)),
        }
    }

    /// Forward a commit decision with the full record
    pub async fn sec_commit<T: Serialize>(
        &self,
        txn: i64,
        seq: u64,
        record: &T,
    ) -> ClientResult<()> {
        self.forward(Method::SecCommit, txn, seq, record).await
    }

    /// Forward an abort decision with the full record
    pub async fn sec_abort<T: Serialize>(&self, txn: i64, record: &T) -> ClientResult<()> {
        self.forward(Method::SecAbort, txn, 0, record).await
    }

    async fn forward<T: Serialize>(
        &self,
        method: Method,
        txn: i64,
        seq: u64,
        record: &T,
    ) -> ClientResult<()> {
        let request = Request::new(method, txn, seq, serde_json::to_vec(record)?);
        match self.single(&request).await? {
            Reply::Ack { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn single(&self, request: &Request) -> ClientResult<Reply> {
        self.call(request)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Unexpected("empty reply".into()))
    }

    async fn call(&self, request: &Request) -> ClientResult<Vec<Reply>> {
        let bytes = self.exchange(request).await?;
        let replies = decode_replies(&bytes)?;
        if let Some(Reply::Error { code, reason, .. }) = replies.first() {
            return Err(ClientError::Server {
                code: *code,
                reason: reason.clone(),
            });
        }
        Ok(replies)
    }

    /// Send one request and read until the server closes
    pub async fn exchange(&self, request: &Request) -> ClientResult<Vec<u8>> {
        let connect = TcpStream::connect(&self.addr);
        let mut stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    addr: self.addr.clone(),
                    source,
                });
            }
            Err(_) => {
                return Err(ClientError::Connect {
                    addr: self.addr.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };

        debug!(
            addr = %self.addr,
            method = %request.header.method,
            txn_id = request.txn(),
            "Sending request"
        );

        let io = async {
            stream.write_all(&request.encode()).await?;
            stream.flush().await?;
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok::<_, std::io::Error>(reply)
        };

        match tokio::time::timeout(self.io_timeout, io).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::TimedOut(request.header.method.clone())),
        }
    }
}

fn unexpected(reply: &Reply) -> ClientError {
    ClientError::Unexpected(format!("{:?}", reply))
}

//! Request and reply framing
//!
//! A request is a header line, a blank line, and exactly `length` raw bytes:
//!
//! ```text
//! METHOD txn_id seq length\r\n
//! \r\n
//! <length bytes>
//! ```
//!
//! Connections are use-once: the server writes one reply and closes. Replies reuse
//! the same header/blank-line shape, except READ which returns raw file bytes and a
//! successful WRITE which returns nothing at all.

use crate::error::{ErrorCode, ProtocolError, Result};
use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Line terminator used by every frame
pub const CRLF: &[u8] = b"\r\n";

/// Read timeout armed on connect and reset on every line
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest header line accepted before the request is rejected
pub const MAX_HEADER_LINE: usize = 4096;

/// Default upper bound on a request body
pub const DEFAULT_MAX_BODY: usize = 64 * 1024 * 1024;

/// Request methods understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read the first bytes of a file (primary only)
    Read,
    /// Open a transaction against a file
    NewTxn,
    /// Store one numbered chunk
    Write,
    /// Commit chunks `0..seq`
    Commit,
    /// Abort a transaction
    Abort,
    /// Secondary join handshake
    NewSec,
    /// Secondary pulls the terminal log records
    SyncLog,
    /// Primary forwards a commit decision
    SecCommit,
    /// Primary forwards an abort decision
    SecAbort,
}

impl Method {
    /// Every method, in dispatch-table order
    pub const ALL: [Method; 9] = [
        Method::Read,
        Method::NewTxn,
        Method::Write,
        Method::Commit,
        Method::Abort,
        Method::NewSec,
        Method::SyncLog,
        Method::SecCommit,
        Method::SecAbort,
    ];

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::NewTxn => "NEW_TXN",
            Self::Write => "WRITE",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::NewSec => "NEW_SEC",
            Self::SyncLog => "SYNC_LOG",
            Self::SecCommit => "SEC_COMMIT",
            Self::SecAbort => "SEC_ABORT",
        }
    }

    /// Look up a method by its wire name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Methods only exchanged between the two nodes of the pair
    pub fn is_replication(self) -> bool {
        matches!(
            self,
            Self::NewSec | Self::SyncLog | Self::SecCommit | Self::SecAbort
        )
    }
}

/// Parsed request header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Method name as sent; unknown names are rejected at dispatch
    pub method: String,
    /// Transaction id
    pub txn: i64,
    /// Chunk sequence number (chunk count for COMMIT)
    pub seq: u64,
    /// Body length in bytes
    pub length: usize,
}

impl RequestHeader {
    /// Parse `METHOD txn seq length`.
    ///
    /// Errors echo the transaction id once it has been parsed, -1 before that.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(ProtocolError::malformed(
                -1,
                "Header has the wrong number of fields.",
            ));
        }

        let non_numeric = |txn| ProtocolError::malformed(txn, "Header has non-numeric value.");

        let txn: i64 = fields[1].parse().map_err(|_| non_numeric(-1))?;
        let seq: i64 = fields[2].parse().map_err(|_| non_numeric(txn))?;
        let length: i64 = fields[3].parse().map_err(|_| non_numeric(txn))?;

        if seq < 0 {
            return Err(ProtocolError::malformed(
                txn,
                "Sequence number has to be a positive integer.",
            ));
        }
        if length < 0 {
            return Err(ProtocolError::malformed(
                txn,
                "Length has to be a non-negative integer.",
            ));
        }

        Ok(Self {
            method: fields[0].to_string(),
            txn,
            seq: seq as u64,
            length: length as usize,
        })
    }
}

/// A complete request: header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Header fields
    pub header: RequestHeader,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl Request {
    /// Build a request for sending
    pub fn new(method: Method, txn: i64, seq: u64, body: Vec<u8>) -> Self {
        Self {
            header: RequestHeader {
                method: method.as_str().to_string(),
                txn,
                seq,
                length: body.len(),
            },
            body,
        }
    }

    /// Known method, or `None` for a name outside the dispatch table
    pub fn method(&self) -> Option<Method> {
        Method::parse(&self.header.method)
    }

    /// Transaction id from the header
    pub fn txn(&self) -> i64 {
        self.header.txn
    }

    /// Sequence number from the header
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Body decoded as text (filenames travel this way)
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Vec<u8> {
        let header = format!(
            "{} {} {} {}\r\n\r\n",
            self.header.method, self.header.txn, self.header.seq, self.header.length
        );
        let mut buf = Vec::with_capacity(header.len() + self.body.len());
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Two-phase request decoder: header line first, then raw byte counting
pub struct RequestReader<R> {
    reader: R,
    timeout: Duration,
    max_body: usize,
}

impl<R: AsyncBufRead + Unpin> RequestReader<R> {
    /// Wrap a buffered stream with the default timeout and body limit
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            timeout: DEFAULT_READ_TIMEOUT,
            max_body: DEFAULT_MAX_BODY,
        }
    }

    /// Set the per-line read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the largest body accepted from clients; replication methods are exempt
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Read one full request.
    ///
    /// The timer is re-armed for every line and once more for the body.
    pub async fn read_request(&mut self) -> Result<Request> {
        let line = self.read_line(-1).await?;
        let header = RequestHeader::parse(&line)?;
        let txn = header.txn;

        let blank = self.read_line(txn).await?;
        if !blank.trim().is_empty() {
            return Err(ProtocolError::malformed(
                txn,
                "Expected a blank line after the header.",
            ));
        }

        // Peer bodies carry whole transactions, which may span many client-sized chunks
        let peer = Method::parse(&header.method).is_some_and(Method::is_replication);
        if !peer && header.length > self.max_body {
            return Err(ProtocolError::malformed(
                txn,
                "Body length exceeds the server limit.",
            ));
        }

        let mut body = vec![0u8; header.length];
        if header.length > 0 {
            match tokio::time::timeout(self.timeout, self.reader.read_exact(&mut body)).await {
                Err(_) => return Err(ProtocolError::TimedOut { txn }),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ProtocolError::Closed);
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(_)) => {}
            }
        }

        Ok(Request { header, body })
    }

    async fn read_line(&mut self, txn: i64) -> Result<String> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.reader).take(MAX_HEADER_LINE as u64);

        let read = match tokio::time::timeout(self.timeout, limited.read_until(b'\n', &mut buf))
            .await
        {
            Err(_) => return Err(ProtocolError::TimedOut { txn }),
            Ok(result) => result?,
        };

        if read == 0 {
            return Err(ProtocolError::Closed);
        }
        if !buf.ends_with(b"\n") {
            if buf.len() >= MAX_HEADER_LINE {
                return Err(ProtocolError::malformed(txn, "Header line is too long."));
            }
            return Err(ProtocolError::Closed);
        }

        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Server-side reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success without a body
    Ack {
        /// Transaction id (the new id for NEW_TXN)
        txn: i64,
    },
    /// Failure with a code and reason
    Error {
        /// Echoed transaction id, -1 when unknown
        txn: i64,
        /// Error code
        code: ErrorCode,
        /// Human-readable reason
        reason: String,
    },
    /// One frame per chunk the client still has to send
    AskResend {
        /// Transaction id
        txn: i64,
        /// Missing sequence numbers
        missing: Vec<u64>,
    },
    /// Files a joining secondary has to pull (JSON list)
    SyncFiles(Vec<u8>),
    /// Terminal log records for a joining secondary (JSON map)
    SyncLog(Vec<u8>),
    /// Raw file bytes (READ)
    Content(Vec<u8>),
    /// Close without writing anything (successful WRITE)
    Silent,
}

impl Response {
    /// Create an error reply
    pub fn error(txn: i64, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Error {
            txn,
            code,
            reason: reason.into(),
        }
    }

    /// Serialize for the wire
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Ack { txn } => format!("ACK {} 0 0 0\r\n\r\n\r\n", txn).into_bytes(),
            Self::Error { txn, code, reason } => {
                let mut buf = format!(
                    "ERROR {} 0 {} {}\r\n\r\n",
                    txn,
                    code.as_u16(),
                    reason.len()
                )
                .into_bytes();
                buf.extend_from_slice(reason.as_bytes());
                buf.extend_from_slice(b"\r\n\r\n");
                buf
            }
            Self::AskResend { txn, missing } => missing
                .iter()
                .flat_map(|seq| format!("ASK_RESEND {} {} 0 0\r\n\r\n\r\n", txn, seq).into_bytes())
                .collect(),
            Self::SyncFiles(payload) => framed("SYNC_FILES", payload),
            Self::SyncLog(payload) => framed("SYNC_LOG", payload),
            Self::Content(bytes) => bytes.clone(),
            Self::Silent => Vec::new(),
        }
    }
}

fn framed(kind: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = format!("{} {}\r\n\r\n", kind, payload.len()).into_bytes();
    buf.extend_from_slice(payload);
    buf
}

/// Client-side view of one reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `ACK`
    Ack {
        /// Transaction id
        txn: i64,
    },
    /// `ERROR`
    Error {
        /// Echoed transaction id
        txn: i64,
        /// Numeric code
        code: u16,
        /// Reason text
        reason: String,
    },
    /// `ASK_RESEND`, one per missing chunk
    AskResend {
        /// Transaction id
        txn: i64,
        /// Missing sequence number
        seq: u64,
    },
    /// `SYNC_FILES` payload
    SyncFiles(Vec<u8>),
    /// `SYNC_LOG` payload
    SyncLog(Vec<u8>),
}

/// Decode every reply frame in a buffer read until EOF
pub fn decode_replies(buf: &[u8]) -> Result<Vec<Reply>> {
    let mut replies = Vec::new();
    let mut pos = skip_blank_lines(buf, 0);

    while pos < buf.len() {
        let rest = &buf[pos..];
        let end = find_crlf(rest)
            .ok_or_else(|| ProtocolError::reply("Reply header is not terminated"))?;
        let line = std::str::from_utf8(&rest[..end])
            .map_err(|_| ProtocolError::reply("Reply header is not valid UTF-8"))?;
        pos += end + CRLF.len();
        if buf[pos..].starts_with(CRLF) {
            pos += CRLF.len();
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (kind, body_len): (ReplyKind, usize) = match fields.as_slice() {
            ["ACK", txn, _, _, len] => (ReplyKind::Ack(field(txn)?), field(len)?),
            ["ERROR", txn, _, code, len] => {
                (ReplyKind::Error(field(txn)?, field(code)?), field(len)?)
            }
            ["ASK_RESEND", txn, seq, _, len] => {
                (ReplyKind::AskResend(field(txn)?, field(seq)?), field(len)?)
            }
            ["SYNC_FILES", len] => (ReplyKind::SyncFiles, field(len)?),
            ["SYNC_LOG", len] => (ReplyKind::SyncLog, field(len)?),
            _ => {
                return Err(ProtocolError::reply(format!(
                    "Unrecognised reply header: {:?}",
                    line
                )));
            }
        };

        if buf.len() < pos + body_len {
            return Err(ProtocolError::reply("Reply body is truncated"));
        }
        let body = buf[pos..pos + body_len].to_vec();
        pos = skip_blank_lines(buf, pos + body_len);

        replies.push(match kind {
            ReplyKind::Ack(txn) => Reply::Ack { txn },
            ReplyKind::Error(txn, code) => Reply::Error {
                txn,
                code,
                reason: String::from_utf8_lossy(&body).into_owned(),
            },
            ReplyKind::AskResend(txn, seq) => Reply::AskResend { txn, seq },
            ReplyKind::SyncFiles => Reply::SyncFiles(body),
            ReplyKind::SyncLog => Reply::SyncLog(body),
        });
    }

    Ok(replies)
}

enum ReplyKind {
    Ack(i64),
    Error(i64, u16),
    AskResend(i64, u64),
    SyncFiles,
    SyncLog,
}

fn field<T: FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ProtocolError::reply(format!("Non-numeric reply field: {:?}", value)))
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(CRLF.len()).position(|w| w == CRLF)
}

fn skip_blank_lines(buf: &[u8], mut pos: usize) -> usize {
    while buf[pos..].starts_with(CRLF) {
        pos += CRLF.len();
    }
    pos
}

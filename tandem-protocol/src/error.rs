//! Error types for the Tandem wire protocol

use std::fmt;
use thiserror::Error;

/// Result type alias using the protocol error
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Numeric error codes carried in `ERROR` replies
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No transaction with that id
    UnknownTransaction = 201,
    /// Operation not allowed on a committed or aborted transaction
    InvalidOperation = 202,
    /// Header or body could not be parsed
    MalformedRequest = 204,
    /// File I/O failed on the server
    FileIo = 205,
    /// Requested file does not exist
    FileNotFound = 206,
    /// Node is not the primary; the reason names the primary's address
    WrongRole = 207,
    /// The peer reported an error while replicating
    PeerError = 208,
    /// Anything else
    Internal = 209,
}

impl ErrorCode {
    /// Numeric value as written on the wire
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            201 => Ok(Self::UnknownTransaction),
            202 => Ok(Self::InvalidOperation),
            204 => Ok(Self::MalformedRequest),
            205 => Ok(Self::FileIo),
            206 => Ok(Self::FileNotFound),
            207 => Ok(Self::WrongRole),
            208 => Ok(Self::PeerError),
            209 => Ok(Self::Internal),
            other => Err(ProtocolError::reply(format!("Unknown error code: {}", other))),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Failures while reading or decoding frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The request could not be parsed. `txn` is -1 when no id was parsed yet.
    #[error("Malformed request (txn {txn}): {reason}")]
    Malformed {
        /// Transaction id to echo in the error reply
        txn: i64,
        /// Human-readable reason sent back to the client
        reason: String,
    },

    /// The read timer fired before a full message arrived
    #[error("Connection timed out (is length longer than data?)")]
    TimedOut {
        /// Transaction id to echo in the error reply
        txn: i64,
    },

    /// The peer closed the connection mid-message
    #[error("Connection closed before the message was complete")]
    Closed,

    /// A reply from the server could not be decoded
    #[error("Invalid reply: {0}")]
    Reply(String),

    /// I/O errors on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Create a malformed-request error
    pub fn malformed(txn: i64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            txn,
            reason: reason.into(),
        }
    }

    /// Create a reply decoding error
    pub fn reply(msg: impl Into<String>) -> Self {
        Self::Reply(msg.into())
    }

    /// Transaction id that an error reply for this failure should echo
    pub fn txn(&self) -> i64 {
        match self {
            Self::Malformed { txn, .. } | Self::TimedOut { txn } => *txn,
            _ => -1,
        }
    }
}

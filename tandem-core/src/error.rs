//! Error types for Tandem Core

use tandem_protocol::ErrorCode;
use thiserror::Error;

/// Result type alias using Tandem Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Tandem
#[derive(Error, Debug)]
pub enum Error {
    /// No transaction with that id in the log
    #[error("Unknown transaction ID: {0}")]
    UnknownTransaction(i64),

    /// Operation not allowed in the transaction's current status
    #[error("{0}")]
    InvalidOperation(String),

    /// Request body could not be interpreted
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// File I/O failure with a client-facing reason
    #[error("{0}")]
    FileIo(String),

    /// Requested file does not exist
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// This node is a secondary
    #[error("Not the primary; primary is at {primary}")]
    NotPrimary {
        /// Address of the current primary
        primary: String,
    },

    /// The peer reported an error while replicating
    #[error("Peer error: {0}")]
    Peer(String),

    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// JSON encoding errors on replication payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Heartbeat socket errors
    #[error("Heartbeat error: {0}")]
    Heartbeat(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-operation error
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Create a bad-request error
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Error::BadRequest(msg.into())
    }

    /// Create a file I/O error
    pub fn file_io<S: Into<String>>(msg: S) -> Self {
        Error::FileIo(msg.into())
    }

    /// Create a peer error
    pub fn peer<S: Into<String>>(msg: S) -> Self {
        Error::Peer(msg.into())
    }

    /// Create a heartbeat error
    pub fn heartbeat<S: Into<String>>(msg: S) -> Self {
        Error::Heartbeat(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Wire code reported to clients
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnknownTransaction(_) => ErrorCode::UnknownTransaction,
            Error::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Error::BadRequest(_) => ErrorCode::MalformedRequest,
            Error::FileIo(_) | Error::Io(_) => ErrorCode::FileIo,
            Error::FileNotFound(_) => ErrorCode::FileNotFound,
            Error::NotPrimary { .. } => ErrorCode::WrongRole,
            Error::Peer(_) => ErrorCode::PeerError,
            Error::Database(_)
            | Error::Serialization(_)
            | Error::Heartbeat(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorCode::Internal,
        }
    }
}

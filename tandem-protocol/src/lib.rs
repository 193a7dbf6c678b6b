//! Tandem Protocol - wire format shared by the server, its peer and clients
//!
//! Provides:
//! - Request header parsing and the two-phase request reader
//! - Reply encoding and decoding (`ACK`, `ERROR`, `ASK_RESEND`, `SYNC_FILES`, `SYNC_LOG`)
//! - Numeric error codes
//! - Join payloads for the primary/secondary handshake
//! - A use-once TCP client

#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod frame;
pub mod sync;

pub use client::{ClientError, ClientResult, CommitReply, FileClient};
pub use error::{ErrorCode, ProtocolError, Result};
pub use frame::{Method, Reply, Request, RequestHeader, RequestReader, Response, decode_replies};
pub use sync::{FileDigests, JoinRequest, diff_files};

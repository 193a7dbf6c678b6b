//! Tandem CLI library: whole-file transfers on top of the protocol client

pub mod transfer;

pub use transfer::{DEFAULT_CHUNK_SIZE, PutReport, get, put, with_redirect};

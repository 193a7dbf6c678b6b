//! Tandem Core - replicated transactional file storage
//!
//! This crate provides the storage and replication engine behind a Tandem node:
//! - Durable transaction log (LMDB via heed, fsync after every mutation)
//! - File store with staged, atomic appends and content digests
//! - Commit engine: chunk completeness, ordered assembly, per-file mutual exclusion
//! - Replication manager: primary/secondary roles, join/sync, decision forwarding
//! - Heartbeat monitor: multicast liveness with a re-arming failover watchdog
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                    Node                      │
//! │   (one method per protocol operation)        │
//! └──────┬───────────────────────┬──────────────┘
//!        │                       │
//! ┌──────┴──────────┐   ┌────────┴─────────────┐
//! │  Commit Engine  │   │ Replication Manager  │◄── Heartbeat Monitor
//! └──────┬──────────┘   └────────┬─────────────┘
//!        │                       │
//! ┌──────┴───────────────────────┴──────────────┐
//! │      Transaction Log   │    File Store       │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod log;
pub mod node;
pub mod replication;
pub mod storage;
pub mod transaction;

pub use error::{Error, Result};
pub use node::{Node, NodeConfig, NodeStatus};
pub use replication::{HeartbeatConfig, ReplicationConfig, Role};
pub use transaction::{CommitOutcome, Transaction, TxnStatus};

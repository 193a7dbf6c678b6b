//! Tandem Server - TCP front end of a Tandem node
//!
//! Every connection carries exactly one request and gets at most one reply:
//! - `NEW_TXN`, `WRITE`, `COMMIT`, `ABORT`, `READ` from clients (primary only)
//! - `NEW_SEC`, `SYNC_LOG` from a joining secondary
//! - `SEC_COMMIT`, `SEC_ABORT` forwarded by the primary
//!
//! The listener is bound before the node takes its role, so requests arriving
//! while a secondary is still joining wait in the accept backlog.

use std::future::Future;
use std::sync::Arc;
use tandem_core::Node;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod config;
pub mod connection;

pub use config::{Config, ConfigError, ServerSettings};

/// Accept connections until `shutdown` resolves, one task per connection
pub async fn serve<F>(listener: TcpListener, node: Arc<Node>, settings: ServerSettings, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested; no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let node = node.clone();
                    let settings = settings.clone();
                    tokio::spawn(async move {
                        connection::handle(stream, peer, node, settings).await;
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
}

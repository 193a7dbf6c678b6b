//! Per-connection request handling
//!
//! Read one request, dispatch it to the node, write the reply, close.

use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::{CommitOutcome, Node};
use tandem_protocol::{ErrorCode, Method, ProtocolError, Request, RequestReader, Response};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::config::ServerSettings;

/// Serve a single connection to completion
pub async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    node: Arc<Node>,
    settings: ServerSettings,
) {
    let (read_half, mut write_half) = stream.split();
    let mut reader = RequestReader::new(BufReader::new(read_half))
        .with_timeout(settings.read_timeout)
        .with_max_body(settings.max_body);

    let response = match reader.read_request().await {
        Ok(request) => dispatch(&node, request).await,
        Err(ProtocolError::Malformed { txn, reason }) => {
            debug!(peer = %peer, txn_id = txn, reason = %reason, "Malformed request");
            Response::error(txn, ErrorCode::MalformedRequest, reason)
        }
        Err(e @ ProtocolError::TimedOut { .. }) => {
            debug!(peer = %peer, "Request timed out");
            Response::error(e.txn(), ErrorCode::MalformedRequest, e.to_string())
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection dropped before a full request");
            return;
        }
    };

    let bytes = response.encode();
    if !bytes.is_empty() {
        if let Err(e) = write_half.write_all(&bytes).await {
            warn!(peer = %peer, error = %e, "Failed to write reply");
            return;
        }
    }
    if let Err(e) = write_half.shutdown().await {
        debug!(peer = %peer, error = %e, "Failed to close connection");
    }
}

/// Route a parsed request to the node and turn the result into a reply
pub async fn dispatch(node: &Node, request: Request) -> Response {
    let txn = request.txn();
    let Some(method) = request.method() else {
        debug!(method = %request.header.method, "Unknown method");
        return Response::error(txn, ErrorCode::MalformedRequest, "Method does not exist.");
    };

    debug!(
        method = method.as_str(),
        txn_id = txn,
        seq = request.seq(),
        length = request.body.len(),
        "Dispatching request"
    );

    match execute(node, method, request).await {
        Ok(response) => response,
        Err(e) => {
            let code = e.code();
            if code == ErrorCode::Internal {
                error!(method = method.as_str(), txn_id = txn, error = %e, "Request failed");
            } else {
                debug!(method = method.as_str(), txn_id = txn, code = code.as_u16(), error = %e, "Request rejected");
            }
            Response::error(txn, code, e.to_string())
        }
    }
}

async fn execute(node: &Node, method: Method, request: Request) -> tandem_core::Result<Response> {
    let txn = request.txn();
    let seq = request.seq();

    let response = match method {
        Method::NewTxn => Response::Ack {
            txn: node.new_txn(&request.body_str())?,
        },
        Method::Write => {
            node.write(txn, seq, request.body).await?;
            Response::Silent
        }
        Method::Commit => match node.commit(txn, seq).await? {
            CommitOutcome::Committed => Response::Ack { txn },
            CommitOutcome::Resend(missing) => Response::AskResend { txn, missing },
        },
        Method::Abort => {
            node.abort(txn).await?;
            Response::Ack { txn }
        }
        Method::Read => Response::Content(node.read(&request.body_str()).await?),
        Method::NewSec => Response::SyncFiles(node.new_sec(&request.body)?),
        Method::SyncLog => Response::SyncLog(node.sync_log()?),
        Method::SecCommit => {
            node.sec_commit(txn, seq, &request.body).await?;
            Response::Ack { txn }
        }
        Method::SecAbort => {
            node.sec_abort(txn, &request.body).await?;
            Response::Ack { txn }
        }
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{NodeConfig, ReplicationConfig, Role};
    use tempfile::TempDir;

    async fn node(dir: &TempDir) -> Arc<Node> {
        let config = NodeConfig {
            storage_dir: dir.path().join("data"),
            map_size: 10 * 1024 * 1024,
            replication: ReplicationConfig::new("127.0.0.1", 7401)
                .with_primary_file(dir.path().join("primary.txt"))
                .without_heartbeat(),
            ..Default::default()
        };
        Node::start(config).await.unwrap()
    }

    fn request(method: &str, txn: i64, seq: u64, body: &[u8]) -> Request {
        let line = format!("{} {} {} {}", method, txn, seq, body.len());
        Request {
            header: tandem_protocol::RequestHeader::parse(&line).unwrap(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_client_flow() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;

        let Response::Ack { txn } = dispatch(&node, request("NEW_TXN", -1, 0, b"f.txt")).await
        else {
            panic!("expected ACK");
        };
        assert_eq!(txn, 1);

        assert_eq!(
            dispatch(&node, request("WRITE", txn, 0, b"AB")).await,
            Response::Silent
        );
        assert_eq!(
            dispatch(&node, request("COMMIT", txn, 2, b"")).await,
            Response::AskResend {
                txn,
                missing: vec![1]
            }
        );
        dispatch(&node, request("WRITE", txn, 1, b"CD")).await;
        assert_eq!(
            dispatch(&node, request("COMMIT", txn, 2, b"")).await,
            Response::Ack { txn }
        );
        assert_eq!(
            dispatch(&node, request("READ", -1, 0, b"f.txt")).await,
            Response::Content(b"ABCD".to_vec())
        );
    }

    #[tokio::test]
    async fn test_dispatch_error_codes() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;

        let Response::Error { txn, code, reason } =
            dispatch(&node, request("FROB", 3, 0, b"")).await
        else {
            panic!("expected ERROR");
        };
        assert_eq!((txn, code), (3, ErrorCode::MalformedRequest));
        assert_eq!(reason, "Method does not exist.");

        let Response::Error { txn, code, .. } =
            dispatch(&node, request("WRITE", 99, 0, b"x")).await
        else {
            panic!("expected ERROR");
        };
        assert_eq!((txn, code), (99, ErrorCode::UnknownTransaction));

        let Response::Error { code, .. } = dispatch(&node, request("READ", -1, 0, b"nope")).await
        else {
            panic!("expected ERROR");
        };
        assert_eq!(code, ErrorCode::FileNotFound);

        let Response::Error { code, .. } =
            dispatch(&node, request("NEW_TXN", -1, 0, b".hidden")).await
        else {
            panic!("expected ERROR");
        };
        assert_eq!(code, ErrorCode::FileIo);
    }

    #[tokio::test]
    async fn test_dispatch_terminal_transactions() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let txn = node.new_txn("f.txt").unwrap();

        assert_eq!(
            dispatch(&node, request("ABORT", txn, 0, b"")).await,
            Response::Ack { txn }
        );
        let Response::Error { code, .. } = dispatch(&node, request("COMMIT", txn, 0, b"")).await
        else {
            panic!("expected ERROR");
        };
        assert_eq!(code, ErrorCode::InvalidOperation);
    }

    #[tokio::test]
    async fn test_dispatch_join_handshake() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        assert!(matches!(node.role(), Role::Primary { secondary: None }));

        let payload = serde_json::json!({"host": "127.0.0.1", "port": 7402, "files": {}});
        let Response::SyncFiles(files) = dispatch(
            &node,
            request("NEW_SEC", -1, 0, payload.to_string().as_bytes()),
        )
        .await
        else {
            panic!("expected SYNC_FILES");
        };
        assert_eq!(files, b"[]");

        let Response::SyncLog(log) = dispatch(&node, request("SYNC_LOG", -1, 0, b"")).await else {
            panic!("expected SYNC_LOG");
        };
        assert_eq!(log, b"{}");
        assert_eq!(
            node.role(),
            Role::Primary {
                secondary: Some("127.0.0.1:7402".into())
            }
        );
    }
}

//! End-to-end tests over real TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::{Node, Role, TxnStatus};
use tandem_protocol::{ClientError, CommitReply, FileClient};
use tandem_server::Config;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct TestServer {
    addr: String,
    node: Arc<Node>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(dir: &TempDir, name: &str) -> Self {
        Self::start_with(dir, name, |_| {}).await
    }

    async fn start_with(dir: &TempDir, name: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_data_dir(dir.path().join(name))
            .with_primary_file(dir.path().join("primary.txt"));
        config.heartbeat.enabled = false;
        config.limits.map_size = 10 * 1024 * 1024;
        config.limits.read_timeout_ms = 300;
        tweak(&mut config);
        config.validate().unwrap();

        let node = Node::start(config.node_config()).await.unwrap();
        let task = tokio::spawn(tandem_server::serve(
            listener,
            node.clone(),
            config.server_settings(),
            std::future::pending(),
        ));

        Self {
            addr: format!("127.0.0.1:{}", port),
            node,
            task,
        }
    }

    fn client(&self) -> FileClient {
        FileClient::new(self.addr.clone())
    }

    fn file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.node.engine().files().root().join(name)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn raw(addr: &str, bytes: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn test_malformed_headers() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(&dir, "data").await;

    assert_eq!(
        raw(&server.addr, b"WRITE abc 0 0\r\n").await,
        "ERROR -1 0 204 29\r\n\r\nHeader has non-numeric value.\r\n\r\n"
    );
    assert_eq!(
        raw(&server.addr, b"COMMIT 1 2\r\n").await,
        "ERROR -1 0 204 38\r\n\r\nHeader has the wrong number of fields.\r\n\r\n"
    );

    let reply = raw(&server.addr, b"WRITE 4 -1 0\r\n").await;
    assert!(reply.starts_with("ERROR 4 0 204 "), "{}", reply);
    assert!(reply.contains("Sequence number has to be a positive integer."));

    assert_eq!(
        raw(&server.addr, b"FROB 5 0 0\r\n\r\n").await,
        "ERROR 5 0 204 22\r\n\r\nMethod does not exist.\r\n\r\n"
    );
}

#[tokio::test]
async fn test_short_body_times_out() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(&dir, "data").await;

    let reply = raw(&server.addr, b"WRITE 1 0 10\r\n\r\nabc").await;
    assert_eq!(
        reply,
        "ERROR 1 0 204 50\r\n\r\nConnection timed out (is length longer than data?)\r\n\r\n"
    );
}

#[tokio::test]
async fn test_client_round_trip() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(&dir, "data").await;
    let client = server.client();

    let txn = client.new_txn("notes.txt").await.unwrap();
    client.write(txn, 2, b"EF").await.unwrap();
    client.write(txn, 0, b"AB").await.unwrap();

    assert_eq!(
        client.commit(txn, 3).await.unwrap(),
        CommitReply::Resend(vec![1])
    );

    client.write(txn, 1, b"CD").await.unwrap();
    assert_eq!(client.commit(txn, 3).await.unwrap(), CommitReply::Ack);
    assert_eq!(client.commit(txn, 3).await.unwrap(), CommitReply::Ack);
    assert_eq!(client.read("notes.txt").await.unwrap(), b"ABCDEF");

    // A second transaction appends
    let txn = client.new_txn("notes.txt").await.unwrap();
    client.write(txn, 0, b"GH").await.unwrap();
    assert_eq!(client.commit(txn, 1).await.unwrap(), CommitReply::Ack);
    assert_eq!(client.read("notes.txt").await.unwrap(), b"ABCDEFGH");

    let err = client.write(txn, 1, b"late").await.unwrap_err();
    assert!(matches!(err, ClientError::Server { code: 202, .. }));

    let err = client.read("missing.txt").await.unwrap_err();
    assert!(matches!(err, ClientError::Server { code: 206, .. }));
}

#[tokio::test]
async fn test_abort_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(&dir, "data").await;
    let client = server.client();

    let txn = client.new_txn("a.txt").await.unwrap();
    client.write(txn, 0, b"keep").await.unwrap();
    client.commit(txn, 1).await.unwrap();

    let txn = client.new_txn("a.txt").await.unwrap();
    client.write(txn, 0, b"drop").await.unwrap();
    client.abort(txn).await.unwrap();

    assert_eq!(client.read("a.txt").await.unwrap(), b"keep");
    let err = client.commit(txn, 1).await.unwrap_err();
    assert!(matches!(err, ClientError::Server { code: 202, .. }));
}

#[tokio::test]
async fn test_replication_join_forward_and_failover() {
    let dir = TempDir::new().unwrap();
    let primary = TestServer::start(&dir, "primary").await;
    let client = primary.client();

    // State that exists before the secondary joins
    let txn = client.new_txn("before.txt").await.unwrap();
    client.write(txn, 0, b"hello ").await.unwrap();
    client.write(txn, 1, b"world").await.unwrap();
    client.commit(txn, 2).await.unwrap();
    let open = client.new_txn("pending.txt").await.unwrap();

    let secondary = TestServer::start(&dir, "secondary").await;
    assert_eq!(
        secondary.node.role(),
        Role::Secondary {
            primary: primary.addr.clone()
        }
    );
    assert_eq!(
        primary.node.role(),
        Role::Primary {
            secondary: Some(secondary.addr.clone())
        }
    );
    assert_eq!(secondary.file("before.txt"), b"hello world");
    assert_eq!(
        secondary.node.engine().files().digests(),
        primary.node.engine().files().digests()
    );

    // Only terminal records are synced
    let log = secondary.node.engine().log();
    assert_eq!(log.get(txn).unwrap().unwrap().status, TxnStatus::Commit);
    assert!(log.get(open).unwrap().is_none());

    // Clients are redirected away from the secondary
    let err = secondary.client().new_txn("x.txt").await.unwrap_err();
    assert!(matches!(err, ClientError::Server { code: 207, .. }));
    assert_eq!(err.redirect(), Some(primary.addr.as_str()));

    // Decisions are forwarded before the primary applies them
    let txn = client.new_txn("after.txt").await.unwrap();
    client.write(txn, 0, b"replicated").await.unwrap();
    client.commit(txn, 1).await.unwrap();
    assert_eq!(secondary.file("after.txt"), b"replicated");
    assert_eq!(log.get(txn).unwrap().unwrap().status, TxnStatus::Commit);

    let aborted = client.new_txn("after.txt").await.unwrap();
    client.write(aborted, 0, b"nope").await.unwrap();
    client.abort(aborted).await.unwrap();
    assert_eq!(log.get(aborted).unwrap().unwrap().status, TxnStatus::Abort);
    assert_eq!(secondary.file("after.txt"), b"replicated");

    // Primary goes silent: the secondary takes over
    secondary.node.on_peer_silence().unwrap();
    assert!(matches!(secondary.node.role(), Role::Primary { .. }));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("primary.txt")).unwrap(),
        format!("127.0.0.1 {}\n", secondary.addr.rsplit(':').next().unwrap())
    );

    let promoted = secondary.client();
    assert_eq!(promoted.read("after.txt").await.unwrap(), b"replicated");
    let next = promoted.new_txn("after.txt").await.unwrap();
    assert!(next > aborted);
}

#[tokio::test]
async fn test_forwarded_commit_larger_than_client_body_limit() {
    const LIMIT: usize = 256 * 1024;
    let dir = TempDir::new().unwrap();
    let limit = |config: &mut Config| config.limits.max_body = LIMIT;
    let primary = TestServer::start_with(&dir, "primary", limit).await;
    let secondary = TestServer::start_with(&dir, "secondary", limit).await;
    assert!(matches!(secondary.node.role(), Role::Secondary { .. }));

    // Each chunk fits the limit; the whole transaction does not
    let chunk: Vec<u8> = (0..LIMIT as u32 / 2).map(|i| (i % 251) as u8).collect();
    let client = primary.client();
    let txn = client.new_txn("big.bin").await.unwrap();
    for seq in 0..3 {
        client.write(txn, seq, &chunk).await.unwrap();
    }
    assert_eq!(client.commit(txn, 3).await.unwrap(), CommitReply::Ack);

    let expected = chunk.repeat(3);
    assert_eq!(primary.file("big.bin"), expected);
    assert_eq!(secondary.file("big.bin"), expected);
    assert_eq!(
        secondary.node.engine().log().get(txn).unwrap().unwrap().status,
        TxnStatus::Commit
    );
}

#[tokio::test]
async fn test_commit_with_huge_seq_keeps_serving() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(&dir, "data").await;
    let client = server.client();

    let txn = client.new_txn("f.txt").await.unwrap();
    client.write(txn, 0, b"A").await.unwrap();

    let reply = raw(
        &server.addr,
        format!("COMMIT {} {} 0\r\n\r\n", txn, i64::MAX).as_bytes(),
    )
    .await;
    assert!(
        reply.starts_with(&format!("ASK_RESEND {} 1 0 0\r\n", txn)),
        "{}",
        reply.lines().next().unwrap_or_default()
    );
    assert_eq!(reply.matches("ASK_RESEND").count(), 1024);

    // Still answering, and the transaction is still open
    assert_eq!(client.commit(txn, 1).await.unwrap(), CommitReply::Ack);
    assert_eq!(client.read("f.txt").await.unwrap(), b"A");
}

#[tokio::test]
async fn test_secondary_join_reconciles_existing_files() {
    let dir = TempDir::new().unwrap();
    let primary = TestServer::start(&dir, "primary").await;
    let client = primary.client();

    for (name, body) in [("same.txt", "same"), ("changed.txt", "new")] {
        let txn = client.new_txn(name).await.unwrap();
        client.write(txn, 0, body.as_bytes()).await.unwrap();
        client.commit(txn, 1).await.unwrap();
    }

    // Secondary storage already holds one matching and one stale file
    let stale = dir.path().join("secondary");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("same.txt"), "same").unwrap();
    std::fs::write(stale.join("changed.txt"), "old").unwrap();

    let secondary = TestServer::start(&dir, "secondary").await;
    assert_eq!(secondary.file("same.txt"), b"same");
    assert_eq!(secondary.file("changed.txt"), b"new");
}

#[tokio::test]
#[ignore = "Needs a network interface with multicast enabled"]
async fn test_heartbeat_failover() {
    use std::time::Duration;

    let dir = TempDir::new().unwrap();
    let mut nodes = Vec::new();
    for name in ["primary", "secondary"] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = Config::default()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_data_dir(dir.path().join(name))
            .with_primary_file(dir.path().join("primary.txt"));
        config.heartbeat.group = "239.255.42.98:8321".parse().unwrap();
        config.heartbeat.interval_ms = 100;
        config.heartbeat.deadline_ms = 300;
        config.limits.map_size = 10 * 1024 * 1024;

        let node = Node::start(config.node_config()).await.unwrap();
        let task = tokio::spawn(tandem_server::serve(
            listener,
            node.clone(),
            config.server_settings(),
            std::future::pending(),
        ));
        nodes.push((node, task));
    }

    let (primary, primary_task) = nodes.remove(0);
    let (secondary, _secondary_task) = nodes.remove(0);
    assert!(matches!(secondary.role(), Role::Secondary { .. }));

    primary.shutdown().await.unwrap();
    primary_task.abort();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(matches!(secondary.role(), Role::Primary { .. }));
}

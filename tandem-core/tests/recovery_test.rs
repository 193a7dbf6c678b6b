//! Restart behaviour: log contents, id counter and staging leftovers survive a
//! process restart the way the node expects.

use std::fs;
use std::time::Duration;
use tandem_core::{CommitOutcome, Node, NodeConfig, ReplicationConfig, TxnStatus};
use tempfile::TempDir;

fn config(dir: &TempDir, port: u16) -> NodeConfig {
    NodeConfig {
        storage_dir: dir.path().join("data"),
        map_size: 10 * 1024 * 1024,
        replication: ReplicationConfig::new("127.0.0.1", port)
            .with_primary_file(dir.path().join("primary.txt"))
            .without_heartbeat(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_committed_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    let (committed, open) = {
        let node = Node::start(config(&dir, 7301)).await.unwrap();
        let committed = node.new_txn("f.txt").unwrap();
        node.write(committed, 0, b"AB".to_vec()).await.unwrap();
        node.write(committed, 1, b"CD".to_vec()).await.unwrap();
        assert_eq!(
            node.commit(committed, 2).await.unwrap(),
            CommitOutcome::Committed
        );

        let open = node.new_txn("g.txt").unwrap();
        node.write(open, 0, b"pending".to_vec()).await.unwrap();
        node.shutdown().await.unwrap();
        (committed, open)
    };

    let node = Node::start(config(&dir, 7301)).await.unwrap();
    let log = node.engine().log();
    assert_eq!(log.get(committed).unwrap().unwrap().status, TxnStatus::Commit);

    // Fresh enough to survive the sweep, and still writable
    assert_eq!(log.get(open).unwrap().unwrap().status, TxnStatus::NewTxn);
    node.write(open, 1, b"!".to_vec()).await.unwrap();
    assert_eq!(node.commit(open, 2).await.unwrap(), CommitOutcome::Committed);
    assert_eq!(node.read("g.txt").await.unwrap(), b"pending!");

    // Ids are never reused across restarts
    let next = node.new_txn("h.txt").unwrap();
    assert!(next > open);

    // Commit stays idempotent after restart
    assert_eq!(
        node.commit(committed, 2).await.unwrap(),
        CommitOutcome::Committed
    );
    assert_eq!(node.read("f.txt").await.unwrap(), b"ABCD");
}

#[tokio::test]
async fn test_startup_cleans_staging_and_sweeps() {
    let dir = TempDir::new().unwrap();

    let stale = {
        let mut cfg = config(&dir, 7302);
        cfg.stale_age = Duration::from_secs(3600);
        let node = Node::start(cfg).await.unwrap();
        node.new_txn("f.txt").unwrap()
    };

    // Simulate a crash in the middle of a commit
    let staging = dir.path().join("data").join(".server_log").join(".lock-f.txt");
    fs::write(&staging, b"half written").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut cfg = config(&dir, 7302);
    cfg.stale_age = Duration::from_millis(1);
    let node = Node::start(cfg).await.unwrap();

    assert!(!staging.exists());
    assert!(!dir.path().join("data").join("f.txt").exists());
    assert_eq!(
        node.engine().log().get(stale).unwrap().unwrap().status,
        TxnStatus::Abort
    );
}

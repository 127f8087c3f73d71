//! Test harness for in-process peerfs-node integration tests.
//!
//! TestNetwork runs one in-memory tracker inventory; every TestNode gets a
//! temp storage directory, a real UDP transfer engine on localhost and a
//! duplex connection to the tracker. A node's tracker identity is its UDP
//! address, so peers resolve it without DNS.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peerfs_blockstore::{BlockStore, FsBlockStore};
use peerfs_inventory::{Inventory, SqliteInventory};
use peerfs_node::control::TrackerClient;
use peerfs_node::controller::Node;
use peerfs_tracker::{run_session, SessionConfig};
use peerfs_transfer::{TransferConfig, TransferEngine};
use tokio::io::DuplexStream;
use tokio::sync::broadcast;

pub struct TestNetwork {
    pub inventory: Arc<dyn Inventory>,
}

#[allow(dead_code)]
impl TestNetwork {
    pub fn new() -> Self {
        Self {
            inventory: Arc::new(SqliteInventory::open_in_memory().unwrap()),
        }
    }

    pub async fn node(&self, block_size: u16) -> TestNode {
        let tempdir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlockStore> = Arc::new(FsBlockStore::open(tempdir.path()).unwrap());
        let config = TransferConfig {
            ack_timeout_ms: 200,
            download_timeout_secs: 15,
            ..TransferConfig::default()
        };
        let engine = TransferEngine::bind("127.0.0.1:0", store, config).await.unwrap();
        let addr = engine.local_addr().unwrap();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let engine_handle = engine.spawn(shutdown_tx.subscribe());

        let (client, server) = tokio::io::duplex(256 * 1024);
        let inventory = self.inventory.clone();
        let identity = addr.to_string();
        let session_identity = identity.clone();
        let session_handle = tokio::spawn(async move {
            run_session(server, &session_identity, inventory, &SessionConfig::default()).await;
        });

        let tracker = TrackerClient::new(client, Duration::from_secs(5));
        TestNode {
            node: Node::new(engine, tracker, block_size, addr.port()),
            identity,
            shutdown_tx,
            _tempdir: tempdir,
            _handles: vec![engine_handle, session_handle],
        }
    }
}

pub struct TestNode {
    pub node: Node<DuplexStream>,
    /// Tracker identity, also the node's UDP address.
    pub identity: String,
    shutdown_tx: broadcast::Sender<()>,
    _tempdir: tempfile::TempDir,
    _handles: Vec<tokio::task::JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn root(&self) -> PathBuf {
        self._tempdir.path().to_path_buf()
    }

    /// Place a whole file in the node's `files/` directory.
    pub fn put_file(&self, name: &str, content: &[u8]) {
        std::fs::write(self.root().join("files").join(name), content).unwrap();
    }

    pub fn read_file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.root().join("files").join(name)).unwrap()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Deterministic file content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

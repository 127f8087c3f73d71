//! Test harness for in-process tracker integration tests.
//!
//! TestTracker owns a file-backed inventory and hands out TestClient
//! connections over in-memory duplex streams, each with an injected host
//! identity so several "nodes" can share one machine.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerfs_inventory::{Inventory, SqliteInventory};
use peerfs_protocol::{NodeCodec, Request, Response};
use peerfs_tracker::{run_session, SessionConfig, SessionEnd};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub struct TestTracker {
    pub inventory: Arc<dyn Inventory>,
    pub session: SessionConfig,
    _tempdir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestTracker {
    pub fn new() -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let inventory = SqliteInventory::open(&tempdir.path().join("tracker.sqlite"), true).unwrap();
        Self {
            inventory: Arc::new(inventory),
            session: SessionConfig::default(),
            _tempdir: tempdir,
        }
    }

    /// Open a session for `host` and return the node's end of it.
    pub fn connect(&self, host: &str) -> TestClient {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let inventory = self.inventory.clone();
        let session = self.session.clone();
        let host = host.to_string();
        let handle =
            tokio::spawn(async move { run_session(server, &host, inventory, &session).await });
        TestClient {
            framed: Framed::new(client, NodeCodec::new()),
            session: handle,
        }
    }
}

pub struct TestClient {
    framed: Framed<DuplexStream, NodeCodec>,
    session: JoinHandle<SessionEnd>,
}

#[allow(dead_code)]
impl TestClient {
    /// Send one request and wait for its response.
    pub async fn request(&mut self, request: Request) -> Response {
        self.framed.send(request).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timeout waiting for tracker response")
            .expect("tracker closed the connection")
            .expect("undecodable tracker response")
    }

    /// Write raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    pub async fn next_response(&mut self) -> Option<Response> {
        self.framed.next().await.map(|r| r.unwrap())
    }

    /// Drop the connection without `LEAVE` and wait for the tracker to notice.
    pub async fn disconnect(self) -> SessionEnd {
        drop(self.framed);
        self.session.await.unwrap()
    }

    /// Wait for the tracker side of the session to finish.
    pub async fn finished(self) -> SessionEnd {
        self.session.await.unwrap()
    }
}

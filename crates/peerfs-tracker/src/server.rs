//! TCP listener: admits node connections and runs one session task each.

use std::net::SocketAddr;
use std::sync::Arc;

use peerfs_inventory::Inventory;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};

use crate::session::{purge_host, serve_requests, LiveHosts, SessionConfig, SessionEnd};

pub struct TrackerServer {
    listener: TcpListener,
    inventory: Arc<dyn Inventory>,
    session: SessionConfig,
    slots: Arc<Semaphore>,
    live: Arc<LiveHosts>,
}

impl TrackerServer {
    /// Bind the listener. At most `max_connections` sessions run at once;
    /// further connections are accepted and wait for a free slot.
    pub async fn bind(
        addr: &str,
        inventory: Arc<dyn Inventory>,
        session: SessionConfig,
        max_connections: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            inventory,
            session,
            slots: Arc::new(Semaphore::new(max_connections.max(1))),
            live: Arc::new(LiveHosts::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until shutdown.
    pub async fn serve(self, shutdown: broadcast::Receiver<()>) {
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_session(stream, peer),
                        Err(e) => tracing::warn!("tracker: accept failed: {e}"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("shutdown signal, stopping accept loop");
                    break;
                }
            }
        }
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let inventory = self.inventory.clone();
        let session = self.session.clone();
        let slots = self.slots.clone();
        let live = self.live.clone();
        // Nodes are keyed by address only; a node reconnecting from the same
        // IP inherits the same inventory identity.
        let host = peer.ip().to_string();
        live.enter(&host);

        tokio::spawn(async move {
            let end = match slots.acquire_owned().await {
                Ok(_permit) => {
                    tracing::debug!(%peer, "tracker: accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, "tracker: set_nodelay failed: {e}");
                    }
                    serve_requests(stream, &host, inventory.as_ref(), &session).await
                }
                Err(_) => SessionEnd::Disconnected,
            };
            let purged = live.leave(&host, || purge_host(inventory.as_ref(), &host, end));
            if !purged {
                tracing::info!(host = %host, ?end, "tracker: session closed, host still connected");
            }
        });
    }
}

//! Transfer engine -- one UDP socket, one receive loop, one sender task per peer.
//!
//! The receive loop demultiplexes by datagram kind:
//!   - ACK  -> the sender task serving that peer
//!   - GET  -> spawn a sender task, unless one already serves that peer
//!   - data -> the receiver sessions; the resulting ACK is sent back
//!
//! Idle receiver sessions are swept from the same loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use peerfs_blockstore::BlockStore;
use peerfs_protocol::{Datagram, PARAMS_V1};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::receiver::Receiver;
use crate::sender::{run_sender, SendJob, SendOutcome};
use crate::{Result, TransferConfig, TransferError, TransferEvent};

/// ACKs buffered per outbound transfer before further ones are dropped.
const ACK_CHANNEL_CAPACITY: usize = 32;

/// How often idle sessions are swept when no datagrams arrive.
const SWEEP_INTERVAL_SECS: u64 = 1;

struct Inner {
    socket: Arc<UdpSocket>,
    store: Arc<dyn BlockStore>,
    config: TransferConfig,
    receiver: Mutex<Receiver>,
    /// Destination -> ACK channel of the transfer serving it. Presence is the
    /// per-destination send lock.
    outbound: Mutex<HashMap<SocketAddr, mpsc::Sender<u16>>>,
    events: broadcast::Sender<TransferEvent>,
}

/// Cheap to clone; every clone drives the same socket and sessions.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        store: Arc<dyn BlockStore>,
        config: TransferConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(addr = %socket.local_addr()?, "transfer: listening");
        let (events, _) = broadcast::channel(256);
        let receiver = Receiver::new(config.window_size, config.session_idle_timeout());
        Ok(Self {
            inner: Arc::new(Inner {
                socket: Arc::new(socket),
                store,
                config,
                receiver: Mutex::new(receiver),
                outbound: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// See [`Receiver::expect`].
    pub fn expect(&self, file_name: &str, division_size: u16, block_count: u16) {
        if let Ok(mut rx) = self.inner.receiver.lock() {
            rx.expect(file_name, division_size, block_count);
        }
    }

    pub fn forget(&self, file_name: &str, division_size: u16) {
        if let Ok(mut rx) = self.inner.receiver.lock() {
            rx.forget(file_name, division_size);
        }
    }

    /// Send a GET datagram to a peer.
    pub async fn request(&self, peer: SocketAddr, request: &Datagram) -> Result<()> {
        let bytes = request.encode()?;
        self.inner.socket.send_to(&bytes, peer).await?;
        tracing::debug!(%peer, kind = request.tag(), "transfer: request sent");
        Ok(())
    }

    /// Whether an outbound transfer to `peer` is running.
    pub fn is_sending_to(&self, peer: &SocketAddr) -> bool {
        self.inner
            .outbound
            .lock()
            .map(|m| m.contains_key(peer))
            .unwrap_or(false)
    }

    pub fn spawn(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    }

    /// Receive loop. Returns on shutdown or when the socket fails.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; PARAMS_V1.max_datagram_bytes + 1];
        let mut sweep_tick =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = self.inner.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, peer)) => self.handle_datagram(peer, &buf[..n]).await,
                        Err(e) => {
                            // ICMP port unreachable from a vanished peer surfaces here on some platforms
                            tracing::debug!("transfer: recv error: {e}");
                        }
                    }
                    self.sweep();
                }
                _ = sweep_tick.tick() => self.sweep(),
                _ = shutdown.recv() => {
                    tracing::info!("transfer: shutting down");
                    return;
                }
            }
        }
    }

    fn sweep(&self) {
        if let Ok(mut rx) = self.inner.receiver.lock() {
            rx.sweep(Instant::now());
        }
    }

    async fn handle_datagram(&self, peer: SocketAddr, bytes: &[u8]) {
        let datagram = match Datagram::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(%peer, "transfer: dropping undecodable datagram: {e}");
                return;
            }
        };

        match datagram {
            Datagram::Ack { ack } => self.route_ack(peer, ack),
            request @ (Datagram::GetFull { .. } | Datagram::GetPartial { .. }) => {
                if let Err(e) = self.start_sender(peer, &request) {
                    tracing::debug!(%peer, "transfer: request ignored: {e}");
                }
            }
            data => self.receive(peer, data).await,
        }
    }

    async fn receive(&self, peer: SocketAddr, datagram: Datagram) {
        // Committing a datagram writes chunks to disk under the receiver lock
        let inner = self.inner.clone();
        let stepped = tokio::task::spawn_blocking(move || {
            let mut rx = inner.receiver.lock().ok()?;
            Some(rx.on_datagram(peer, &datagram, Instant::now(), inner.store.as_ref()))
        })
        .await;
        let outcome = match stepped {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                tracing::error!("transfer: receiver state poisoned");
                return;
            }
            Err(e) => {
                tracing::error!(%peer, "transfer: receive task failed: {e}");
                return;
            }
        };

        if let Some(ack) = outcome.ack {
            if let Err(e) = self.send_ack(peer, ack).await {
                tracing::debug!(%peer, ack, "transfer: ack send failed: {e}");
            }
        }
        if let Some(done) = outcome.completed {
            let _ = self.inner.events.send(TransferEvent::Received {
                peer: done.peer,
                file_name: done.file_name,
                division_size: done.division_size,
                blocks: done.blocks,
            });
        }
    }

    async fn send_ack(&self, peer: SocketAddr, ack: u16) -> Result<()> {
        let bytes = Datagram::Ack { ack }.encode()?;
        self.inner.socket.send_to(&bytes, peer).await?;
        Ok(())
    }

    fn route_ack(&self, peer: SocketAddr, ack: u16) {
        let tx = match self.inner.outbound.lock() {
            Ok(map) => map.get(&peer).cloned(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => {
                if tx.try_send(ack).is_err() {
                    tracing::trace!(%peer, ack, "transfer: ack dropped");
                }
            }
            None => tracing::trace!(%peer, ack, "transfer: ack for no transfer"),
        }
    }

    fn start_sender(&self, peer: SocketAddr, request: &Datagram) -> Result<()> {
        if self.is_sending_to(&peer) {
            return Err(TransferError::Busy(peer));
        }

        let job = match SendJob::resolve(peer, request, self.inner.store.as_ref()) {
            Ok(job) => job,
            Err((status, reason)) => {
                tracing::warn!(%peer, ?status, "transfer: cannot serve request: {reason}");
                return Ok(());
            }
        };

        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        {
            let mut outbound = self
                .inner
                .outbound
                .lock()
                .map_err(|_| std::io::Error::other("outbound map poisoned"))?;
            if outbound.contains_key(&peer) {
                return Err(TransferError::Busy(peer));
            }
            outbound.insert(peer, ack_tx);
        }

        tracing::info!(%peer, file = %job.file_name, division_size = job.division_size, blocks = job.blocks.len(), "transfer: serving request");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let hash = job.hash.clone();
            let division_size = job.division_size;
            let blocks = job.blocks.len();
            let outcome = run_sender(
                inner.socket.clone(),
                inner.store.clone(),
                job,
                ack_rx,
                inner.config.clone(),
            )
            .await;

            if let Ok(mut outbound) = inner.outbound.lock() {
                outbound.remove(&peer);
            }

            let event = match outcome {
                Ok(SendOutcome::Completed { .. }) => TransferEvent::Sent {
                    peer,
                    hash,
                    division_size,
                    blocks,
                },
                Ok(SendOutcome::Abandoned { seq, .. }) => TransferEvent::Abandoned {
                    peer,
                    hash,
                    division_size,
                    seq,
                },
                Err(e) => {
                    tracing::warn!(%peer, "transfer: send failed: {e}");
                    TransferEvent::Abandoned {
                        peer,
                        hash,
                        division_size,
                        seq: 0,
                    }
                }
            };
            let _ = inner.events.send(event);
        });
        Ok(())
    }
}

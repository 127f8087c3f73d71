//! Tracker session handler: one per accepted node connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerfs_inventory::{Inventory, InventoryError};
use peerfs_protocol::{ProtocolError, Request, Response, Status, TrackerCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::config::TrackerSection;
use crate::locate::{group_by_peer, group_name_hits};

/// Per-connection timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Read timeout between requests. Expiry is not fatal on its own.
    pub idle_timeout: Duration,
    /// Close after this many consecutive idle timeouts; `None` never closes.
    pub idle_timeouts_before_close: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&TrackerSection::default())
    }
}

impl From<&TrackerSection> for SessionConfig {
    fn from(section: &TrackerSection) -> Self {
        Self {
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
            idle_timeouts_before_close: section.idle_timeouts_before_close,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The node sent `LEAVE`.
    Left,
    /// End of stream or a transport error.
    Disconnected,
    /// The node sent something undecodable; the status it was answered with.
    Rejected(Status),
    /// Idle-timeout cap reached.
    IdleLimit,
}

/// Open sessions per host identity.
///
/// Several connections can share one identity, e.g. a node reconnecting
/// before its previous session noticed the disconnect. Only the last of them
/// to close purges the host, and the purge runs under the same lock that
/// admits new sessions, so it never removes what a newer session registered.
#[derive(Debug, Default)]
pub struct LiveHosts {
    open: Mutex<HashMap<String, usize>>,
}

impl LiveHosts {
    pub fn enter(&self, host: &str) {
        if let Ok(mut open) = self.open.lock() {
            *open.entry(host.to_string()).or_default() += 1;
        }
    }

    /// Close one session of `host`; runs `purge` if it was the last one.
    /// Returns whether `purge` ran.
    pub fn leave(&self, host: &str, purge: impl FnOnce()) -> bool {
        let Ok(mut open) = self.open.lock() else {
            return false;
        };
        let last = match open.get_mut(host) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                open.remove(host);
                true
            }
        };
        if last {
            purge();
        }
        last
    }

    pub fn sessions(&self, host: &str) -> usize {
        self.open
            .lock()
            .map(|open| open.get(host).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Serve one node connection until it leaves, disconnects, sends garbage or
/// hits the idle cap, then delete everything `host` registered.
pub async fn run_session<S>(
    stream: S,
    host: &str,
    inventory: Arc<dyn Inventory>,
    config: &SessionConfig,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let end = serve_requests(stream, host, inventory.as_ref(), config).await;
    purge_host(inventory.as_ref(), host, end);
    end
}

/// Delete everything `host` registered.
pub fn purge_host(inventory: &dyn Inventory, host: &str, end: SessionEnd) {
    match inventory.delete_node(host) {
        Ok(existed) => {
            tracing::info!(host = %host, ?end, purged = existed, "tracker: session closed")
        }
        Err(e) => tracing::error!(host = %host, ?end, "tracker: failed to purge node: {e}"),
    }
}

/// The request loop of [`run_session`], without the purge.
pub async fn serve_requests<S>(
    stream: S,
    host: &str,
    inventory: &dyn Inventory,
    config: &SessionConfig,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, TrackerCodec::new());
    let mut idle_ticks: u32 = 0;

    tracing::info!(host = %host, "tracker: session opened");

    let end = loop {
        let next = match tokio::time::timeout(config.idle_timeout, framed.next()).await {
            Ok(next) => next,
            Err(_) => {
                idle_ticks += 1;
                tracing::trace!(host = %host, idle_ticks, "tracker: session idle");
                match config.idle_timeouts_before_close {
                    Some(cap) if idle_ticks >= cap => break SessionEnd::IdleLimit,
                    _ => continue,
                }
            }
        };
        idle_ticks = 0;

        let request = match next {
            None => break SessionEnd::Disconnected,
            Some(Ok(request)) => request,
            Some(Err(ProtocolError::Io(e))) => {
                tracing::debug!(host = %host, "tracker: read failed: {e}");
                break SessionEnd::Disconnected;
            }
            Some(Err(e)) => {
                let status = match e {
                    ProtocolError::InvalidAction(_) => Status::InvalidAction,
                    _ => Status::InvalidRequest,
                };
                tracing::warn!(host = %host, ?status, "tracker: rejecting request: {e}");
                let counter = framed.codec().counter();
                if let Err(e) = framed.send(Response::Status { status, counter }).await {
                    tracing::debug!(host = %host, "tracker: write failed: {e}");
                }
                break SessionEnd::Rejected(status);
            }
        };

        let counter = framed.codec().counter();
        let leaving = matches!(request, Request::Leave);
        tracing::debug!(host = %host, action = ?request.action(), counter, "tracker: request");

        let response = if leaving {
            Response::Status {
                status: Status::Success,
                counter,
            }
        } else {
            dispatch(inventory, host, request, counter)
        };

        if let Err(e) = framed.send(response).await {
            tracing::debug!(host = %host, "tracker: write failed: {e}");
            break SessionEnd::Disconnected;
        }
        if leaving {
            break SessionEnd::Left;
        }
    };
    end
}

/// Apply one request to the inventory and build its response.
pub fn dispatch(inventory: &dyn Inventory, host: &str, request: Request, counter: u16) -> Response {
    match request {
        Request::UpdateFullFiles(files) => Response::Status {
            status: status_of(inventory.update_full(host, &files), host),
            counter,
        },
        Request::UpdatePartial(files) => Response::Status {
            status: status_of(inventory.update_partial(host, &files), host),
            counter,
        },
        Request::UpdateStatus { status } => Response::Status {
            status: status_of(inventory.update_status(host, status), host),
            counter,
        },
        Request::CheckStatus { host: target } => match inventory.get_status(&target) {
            Ok(Some(node_status)) => Response::CheckStatus {
                status: Status::Success,
                node_status,
                counter,
            },
            Ok(None) => Response::CheckStatus {
                status: Status::NotFound,
                node_status: 0,
                counter,
            },
            Err(e) => Response::CheckStatus {
                status: failure_status(&e, host),
                node_status: 0,
                counter,
            },
        },
        Request::LocateHash { hash } => match inventory.locate_by_hash(&hash, host) {
            Ok(rows) => {
                let peers = group_by_peer(&rows);
                Response::LocateHash {
                    status: found_status(!peers.is_empty()),
                    peers,
                    counter,
                }
            }
            Err(e) => Response::LocateHash {
                status: failure_status(&e, host),
                peers: Vec::new(),
                counter,
            },
        },
        Request::LocateName { name } => match inventory.locate_by_name(&name, host) {
            Ok(hits) => {
                let matches = group_name_hits(&hits);
                Response::LocateName {
                    status: found_status(!matches.is_empty()),
                    matches,
                    counter,
                }
            }
            Err(e) => Response::LocateName {
                status: failure_status(&e, host),
                matches: Vec::new(),
                counter,
            },
        },
        // Answered by the session loop before dispatch.
        Request::Leave => Response::Status {
            status: Status::Success,
            counter,
        },
    }
}

fn found_status(found: bool) -> Status {
    if found {
        Status::Success
    } else {
        Status::NotFound
    }
}

fn status_of(result: peerfs_inventory::Result<()>, host: &str) -> Status {
    match result {
        Ok(()) => Status::Success,
        Err(e) => failure_status(&e, host),
    }
}

fn failure_status(e: &InventoryError, host: &str) -> Status {
    match e {
        InventoryError::InvalidRequest(_) => {
            tracing::warn!(host = %host, "tracker: invalid request: {e}");
            Status::InvalidRequest
        }
        _ => {
            tracing::error!(host = %host, "tracker: inventory failure: {e}");
            Status::ServerError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerfs_inventory::SqliteInventory;
    use peerfs_protocol::{FullDivision, FullFile, Holding, NodeCodec};
    use tokio::io::AsyncWriteExt;

    fn inventory() -> Arc<dyn Inventory> {
        Arc::new(SqliteInventory::open_in_memory().unwrap())
    }

    fn report(hash: &str) -> FullFile {
        FullFile {
            hash: hash.into(),
            name: "report.pdf".into(),
            divisions: vec![FullDivision {
                division_size: 256,
                last_block_size: 100,
                block_count: 5,
            }],
        }
    }

    #[test]
    fn test_dispatch_locate_excludes_requester() {
        let inv = inventory();
        let response = dispatch(inv.as_ref(), "node1", Request::UpdateFullFiles(vec![report("h")]), 1);
        assert_eq!(response.status(), Status::Success);

        let own = dispatch(inv.as_ref(), "node1", Request::LocateHash { hash: "h".into() }, 2);
        assert_eq!(own.status(), Status::NotFound);

        match dispatch(inv.as_ref(), "node2", Request::LocateHash { hash: "h".into() }, 1) {
            Response::LocateHash { status, peers, counter } => {
                assert_eq!(status, Status::Success);
                assert_eq!(counter, 1);
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].divisions[0].holding, Holding::Full { block_count: 5 });
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_invalid_update_maps_to_invalid_request() {
        let inv = inventory();
        let mut file = report("h");
        file.divisions[0].division_size = 0;
        let response = dispatch(inv.as_ref(), "node1", Request::UpdateFullFiles(vec![file]), 1);
        assert_eq!(response.status(), Status::InvalidRequest);
    }

    #[test]
    fn test_dispatch_check_status_unknown_host() {
        let inv = inventory();
        match dispatch(inv.as_ref(), "node1", Request::CheckStatus { host: "ghost".into() }, 4) {
            Response::CheckStatus { status, node_status, counter } => {
                assert_eq!(status, Status::NotFound);
                assert_eq!(node_status, 0);
                assert_eq!(counter, 4);
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_answered_then_closed() {
        let inv = inventory();
        let (client, server) = tokio::io::duplex(4096);
        let session = {
            let inv = inv.clone();
            tokio::spawn(async move { run_session(server, "node1", inv, &SessionConfig::default()).await })
        };

        let mut client = Framed::new(client, NodeCodec::new());
        client.get_mut().write_all(&[0x02]).await.unwrap();
        let response = client.next().await.unwrap().unwrap();
        assert_eq!(
            response,
            Response::Status { status: Status::InvalidAction, counter: 1 }
        );
        assert_eq!(session.await.unwrap(), SessionEnd::Rejected(Status::InvalidAction));
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_counter_increments_per_request() {
        let inv = inventory();
        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            run_session(server, "node1", inv, &SessionConfig::default()).await
        });

        let mut client = Framed::new(client, NodeCodec::new());
        client.send(Request::UpdateStatus { status: 7 }).await.unwrap();
        client.send(Request::CheckStatus { host: "node1".into() }).await.unwrap();
        client.send(Request::Leave).await.unwrap();

        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Response::Status { status: Status::Success, counter: 1 }
        );
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Response::CheckStatus { status: Status::Success, node_status: 7, counter: 2 }
        );
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Response::Status { status: Status::Success, counter: 3 }
        );
        assert_eq!(session.await.unwrap(), SessionEnd::Left);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cap_closes_session() {
        let inv = inventory();
        let (_client, server) = tokio::io::duplex(64);
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(1),
            idle_timeouts_before_close: Some(3),
        };
        let end = run_session(server, "node1", inv, &config).await;
        assert_eq!(end, SessionEnd::IdleLimit);
    }

    #[test]
    fn test_only_last_session_of_a_host_purges() {
        let live = LiveHosts::default();
        live.enter("10.0.0.1");
        live.enter("10.0.0.1");
        live.enter("10.0.0.2");

        let mut purged = Vec::new();
        assert!(!live.leave("10.0.0.1", || purged.push("first")));
        assert_eq!(live.sessions("10.0.0.1"), 1);
        assert!(live.leave("10.0.0.1", || purged.push("second")));
        assert_eq!(purged, vec!["second"]);
        assert_eq!(live.sessions("10.0.0.1"), 0);
        assert_eq!(live.sessions("10.0.0.2"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_purges_host() {
        let inv = inventory();
        inv.update_full("node1", &[report("h")]).unwrap();
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let end = run_session(server, "node1", inv.clone(), &SessionConfig::default()).await;
        assert_eq!(end, SessionEnd::Disconnected);
        assert!(inv.locate_by_hash("h", "other").unwrap().is_empty());
        assert_eq!(inv.get_status("node1").unwrap(), None);
    }
}

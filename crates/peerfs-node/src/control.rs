//! Node control session: the node's persistent connection to the tracker.
//!
//! Requests are written in order and each one reserves a slot in a FIFO of
//! pending responses. The tracker answers strictly in arrival order, so the
//! next response read always belongs to the oldest slot; its counter and
//! kind are checked against that slot.
//!
//! A slot whose read timed out stays queued as abandoned: its response may
//! still arrive, and is discarded when it does.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerfs_protocol::{
    Action, FullFile, NameMatch, NodeCodec, PartialFile, PeerHolding, ProtocolError, Request,
    Response, Status,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("tracker closed the connection")]
    Closed,
    #[error("no request is waiting for a response")]
    NothingPending,
    #[error("response counter {got} does not match request {expected}")]
    CounterMismatch { expected: u16, got: u16 },
    #[error("expected a {expected:?} response, got {got:?}")]
    UnexpectedResponse { expected: Action, got: Action },
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, Copy)]
struct Pending {
    counter: u16,
    expects: Action,
    abandoned: bool,
}

/// Counter order with wrap-around: whether `a` was issued before `b`.
fn issued_before(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

fn expected_response(request: &Request) -> Action {
    match request {
        Request::LocateHash { .. } => Action::ResponseLocateHash,
        Request::LocateName { .. } => Action::ResponseLocateName,
        Request::CheckStatus { .. } => Action::ResponseCheckStatus,
        _ => Action::Response,
    }
}

pub struct TrackerClient<S = TcpStream> {
    framed: Framed<S, NodeCodec>,
    pending: VecDeque<Pending>,
    sent: u16,
    read_timeout: Duration,
}

impl TrackerClient<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::info!(tracker = %stream.peer_addr()?, "control: connected to tracker");
        Ok(Self::new(stream, read_timeout))
    }
}

impl<S> TrackerClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, NodeCodec::new()),
            pending: VecDeque::new(),
            sent: 0,
            read_timeout,
        }
    }

    /// Requests sent whose responses are still awaited.
    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|p| !p.abandoned).count()
    }

    /// Write one request and reserve its response slot.
    pub async fn send(&mut self, request: Request) -> Result<()> {
        let expects = expected_response(&request);
        let action = request.action();
        self.framed.send(request).await?;
        self.sent = self.sent.wrapping_add(1);
        self.pending.push_back(Pending {
            counter: self.sent,
            expects,
            abandoned: false,
        });
        tracing::debug!(?action, counter = self.sent, "control: request sent");
        Ok(())
    }

    /// Read the response to the oldest pending request.
    ///
    /// A generic `RESPONSE` is accepted in place of any specific kind: the
    /// tracker uses it to reject requests it cannot decode. Late responses to
    /// abandoned requests are skipped. On timeout the request is abandoned.
    pub async fn recv(&mut self) -> Result<Response> {
        let slot = self
            .pending
            .iter()
            .find(|p| !p.abandoned)
            .copied()
            .ok_or(ControlError::NothingPending)?;
        let deadline = tokio::time::Instant::now() + self.read_timeout;

        let response = loop {
            let response = match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => {
                    if let Some(p) = self.pending.iter_mut().find(|p| p.counter == slot.counter) {
                        p.abandoned = true;
                    }
                    tracing::debug!(counter = slot.counter, "control: tracker slow, request abandoned");
                    return Err(ControlError::Timeout(self.read_timeout));
                }
                Ok(None) => return Err(ControlError::Closed),
                Ok(Some(response)) => response?,
            };

            let got = response.counter();
            if issued_before(got, slot.counter) {
                self.pending
                    .retain(|p| !(p.abandoned && !issued_before(got, p.counter)));
                tracing::debug!(counter = got, "control: discarding late response");
                continue;
            }
            break response;
        };

        // Everything up to and including this slot is settled now
        self.pending
            .retain(|p| issued_before(slot.counter, p.counter));
        if response.counter() != slot.counter {
            return Err(ControlError::CounterMismatch {
                expected: slot.counter,
                got: response.counter(),
            });
        }
        let got = response.action();
        if got != slot.expects && got != Action::Response {
            return Err(ControlError::UnexpectedResponse {
                expected: slot.expects,
                got,
            });
        }
        if !response.status().is_success() {
            tracing::debug!(status = ?response.status(), counter = slot.counter, "control: tracker refused request");
        }
        Ok(response)
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: Request) -> Result<Response> {
        self.send(request).await?;
        self.recv().await
    }

    pub async fn update_full(&mut self, files: Vec<FullFile>) -> Result<Status> {
        Ok(self.call(Request::UpdateFullFiles(files)).await?.status())
    }

    pub async fn update_partial(&mut self, files: Vec<PartialFile>) -> Result<Status> {
        Ok(self.call(Request::UpdatePartial(files)).await?.status())
    }

    pub async fn update_status(&mut self, status: u8) -> Result<Status> {
        Ok(self.call(Request::UpdateStatus { status }).await?.status())
    }

    /// `(status, node_status)` of `host`.
    pub async fn check_status(&mut self, host: &str) -> Result<(Status, u8)> {
        match self.call(Request::CheckStatus { host: host.to_string() }).await? {
            Response::CheckStatus {
                status,
                node_status,
                ..
            } => Ok((status, node_status)),
            other => Ok((other.status(), 0)),
        }
    }

    pub async fn locate_hash(&mut self, hash: &str) -> Result<(Status, Vec<PeerHolding>)> {
        match self.call(Request::LocateHash { hash: hash.to_string() }).await? {
            Response::LocateHash { status, peers, .. } => Ok((status, peers)),
            other => Ok((other.status(), Vec::new())),
        }
    }

    pub async fn locate_name(&mut self, name: &str) -> Result<(Status, Vec<NameMatch>)> {
        match self.call(Request::LocateName { name: name.to_string() }).await? {
            Response::LocateName {
                status, matches, ..
            } => Ok((status, matches)),
            other => Ok((other.status(), Vec::new())),
        }
    }

    /// Announce departure. The tracker acknowledges, then closes.
    pub async fn leave(&mut self) -> Result<Status> {
        Ok(self.call(Request::Leave).await?.status())
    }
}

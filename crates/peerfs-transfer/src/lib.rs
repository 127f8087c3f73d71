//! peerfs Transfer -- reliable block transfer over UDP.
//!
//! Stop-and-wait with a small receive window:
//!   - the sender transmits one datagram at a time and waits for a cumulative
//!     ACK, retransmitting on timeout up to a fixed retry budget
//!   - the receiver buffers datagrams that arrive ahead of the next expected
//!     sequence number (within the window) and commits blocks strictly in order
//!
//! `receiver::Receiver` is pure session state; `engine::TransferEngine` owns
//! the socket, demultiplexes datagrams and runs one sender task per peer.

use std::net::SocketAddr;
use std::time::Duration;

use peerfs_blockstore::BlockStoreError;
use peerfs_protocol::{FileHash, ProtocolError, PARAMS_V1};
use serde::{Deserialize, Serialize};

pub mod engine;
pub mod receiver;
pub mod sender;

pub use engine::TransferEngine;
pub use receiver::Receiver;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("block store error: {0}")]
    Store(#[from] BlockStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("block of {size} bytes does not fit one datagram (max {max})")]
    BlockTooLarge { size: usize, max: usize },
    #[error("outbound transfer to {0} already running")]
    Busy(SocketAddr),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Timing and window settings, `[transfer]` in the node config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_window_size")]
    pub window_size: u16,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// How long a download waits for all of its transfers to complete.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_window_size() -> u16 {
    PARAMS_V1.window_size
}

fn default_ack_timeout_ms() -> u64 {
    PARAMS_V1.ack_timeout_ms
}

fn default_max_retries() -> u32 {
    PARAMS_V1.max_retries
}

fn default_session_idle_timeout_secs() -> u64 {
    PARAMS_V1.session_idle_timeout_secs
}

fn default_download_timeout_secs() -> u64 {
    120
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl TransferConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Progress reported to whoever drives downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// An inbound transfer committed its final datagram.
    Received {
        peer: SocketAddr,
        file_name: String,
        division_size: u16,
        /// Blocks committed by this session.
        blocks: u16,
    },
    /// An outbound transfer had its last datagram acknowledged.
    Sent {
        peer: SocketAddr,
        hash: FileHash,
        division_size: u16,
        blocks: usize,
    },
    /// An outbound transfer ran out of retries.
    Abandoned {
        peer: SocketAddr,
        hash: FileHash,
        division_size: u16,
        seq: u16,
    },
}

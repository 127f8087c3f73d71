//! Send side: one task per destination, one datagram in flight.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use peerfs_blockstore::{BlockStore, BlockStoreError, FileRef};
use peerfs_protocol::{DataBlock, Datagram, FileHash, Status, PARAMS_V1};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{Result, TransferConfig, TransferError};

/// Largest transfer whose sequence numbers and final ACK fit in a u16.
pub const MAX_BLOCKS_PER_TRANSFER: usize = u16::MAX as usize - 1;

/// A resolved GET request: which blocks of which file go to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendJob {
    pub peer: SocketAddr,
    pub hash: FileHash,
    pub file_name: String,
    pub division_size: u16,
    /// Block numbers in send order; block `blocks[i]` travels as sequence `i + 1`.
    pub blocks: Vec<u16>,
}

impl SendJob {
    /// Resolve a GET datagram against the local store.
    ///
    /// Failures carry the status the request would be answered with; the
    /// datagram protocol has no error reply, so the caller only logs them.
    pub fn resolve(
        peer: SocketAddr,
        request: &Datagram,
        store: &dyn BlockStore,
    ) -> std::result::Result<Self, (Status, String)> {
        let (hash, division_size) = match request {
            Datagram::GetFull {
                hash,
                division_size,
            }
            | Datagram::GetPartial {
                hash,
                division_size,
                ..
            } => (hash, *division_size),
            other => {
                return Err((
                    Status::InvalidRequest,
                    format!("{other:?} is not a GET request"),
                ))
            }
        };

        let file_name = store
            .file_name_for_hash(hash)
            .map_err(|e| (Status::FileNotFound, e.to_string()))?;

        let blocks = match request {
            Datagram::GetPartial { blocks, .. } => {
                let wanted = blocks.expand();
                let held = store
                    .get_all_block_numbers(FileRef::Name(&file_name), division_size)
                    .map_err(|e| (Status::BlockNotFound, e.to_string()))?;
                if let Some(missing) = wanted.iter().find(|n| held.binary_search(n).is_err()) {
                    return Err((
                        Status::BlockNotFound,
                        format!("block {missing} of {file_name} @ {division_size}"),
                    ));
                }
                wanted
            }
            _ => {
                let count = store
                    .get_block_count(FileRef::Name(&file_name), division_size)
                    .map_err(|e| match e {
                        BlockStoreError::NotFound(msg) => (Status::BlockNotFound, msg),
                        other => (Status::ServerError, other.to_string()),
                    })?;
                (1..=count).collect()
            }
        };

        if blocks.is_empty() || blocks.len() > MAX_BLOCKS_PER_TRANSFER {
            return Err((
                Status::InvalidRequest,
                format!("{} blocks requested", blocks.len()),
            ));
        }

        Ok(Self {
            peer,
            hash: hash.clone(),
            file_name,
            division_size,
            blocks,
        })
    }

    /// Datagram carrying `blocks[index]`.
    fn datagram(&self, index: usize, data: Bytes) -> Datagram {
        let seq = index as u16 + 1;
        let block = DataBlock {
            division_size: self.division_size,
            block_number: self.blocks[index],
            data,
        };
        let first = index == 0;
        let last = index + 1 == self.blocks.len();
        match (first, last) {
            (true, true) => Datagram::StartEnd {
                seq,
                name: self.file_name.clone(),
                block,
            },
            (true, false) => Datagram::Start {
                seq,
                name: self.file_name.clone(),
                block,
            },
            (false, true) => Datagram::End { seq, block },
            (false, false) => Datagram::Data { seq, block },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every datagram acknowledged.
    Completed { datagrams_sent: usize },
    /// `seq` went unacknowledged through the whole retry budget.
    Abandoned { seq: u16, attempts: u32 },
}

enum AckWait {
    /// Cumulative ACK at or past the one we were waiting for.
    Acked(u16),
    TimedOut,
    Closed,
}

/// Wait until `deadline` for an ACK of at least `wanted`. Stale ACKs are skipped.
async fn wait_for_ack(acks: &mut mpsc::Receiver<u16>, wanted: u32, deadline: Instant) -> AckWait {
    loop {
        match tokio::time::timeout_at(deadline, acks.recv()).await {
            Ok(Some(ack)) if ack as u32 >= wanted => return AckWait::Acked(ack),
            Ok(Some(stale)) => {
                tracing::trace!(ack = stale, wanted, "transfer: stale ack");
            }
            Ok(None) => return AckWait::Closed,
            Err(_) => return AckWait::TimedOut,
        }
    }
}

/// Send every block of `job`, stop-and-wait.
///
/// `acks` yields the ACK numbers the engine receives from `job.peer`.
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    store: Arc<dyn BlockStore>,
    job: SendJob,
    mut acks: mpsc::Receiver<u16>,
    config: TransferConfig,
) -> Result<SendOutcome> {
    let max_payload = PARAMS_V1.max_block_payload();
    let mut next_needed: u32 = 1;
    let mut datagrams_sent = 0usize;

    for index in 0..job.blocks.len() {
        let seq = index as u16 + 1;
        if (seq as u32) < next_needed {
            // Acknowledged past this one already
            continue;
        }

        let data = store.get_block(FileRef::Name(&job.file_name), job.division_size, job.blocks[index])?;
        if data.len() > max_payload {
            return Err(TransferError::BlockTooLarge {
                size: data.len(),
                max: max_payload,
            });
        }
        let bytes = job.datagram(index, Bytes::from(data)).encode()?;

        let mut attempts: u32 = 0;
        loop {
            socket.send_to(&bytes, job.peer).await?;
            attempts += 1;
            datagrams_sent += 1;

            let deadline = Instant::now() + config.ack_timeout();
            match wait_for_ack(&mut acks, seq as u32 + 1, deadline).await {
                AckWait::Acked(ack) => {
                    if ack as u32 > seq as u32 + 1 {
                        tracing::debug!(peer = %job.peer, seq, ack, "transfer: peer is ahead, skipping");
                    }
                    next_needed = ack as u32;
                    break;
                }
                AckWait::TimedOut if attempts > config.max_retries => {
                    tracing::warn!(peer = %job.peer, file = %job.file_name, seq, attempts, "transfer: no ack, abandoning");
                    return Ok(SendOutcome::Abandoned { seq, attempts });
                }
                AckWait::TimedOut => {
                    tracing::debug!(peer = %job.peer, seq, attempt = attempts, "transfer: ack timeout, resending");
                }
                AckWait::Closed => {
                    return Ok(SendOutcome::Abandoned { seq, attempts });
                }
            }
        }
    }

    tracing::info!(peer = %job.peer, file = %job.file_name, division_size = job.division_size, blocks = job.blocks.len(), "transfer: send complete");
    Ok(SendOutcome::Completed { datagrams_sent })
}

//! Receive-side session state, one session per sending peer.
//!
//! A session remembers the last committed sequence number. A datagram is
//! buffered iff `committed < seq <= committed + window`; buffered datagrams
//! are drained to the block store in sequence order, so a later block is never
//! written before an earlier one. Every accepted datagram is answered with the
//! cumulative ACK `committed + 1`.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use peerfs_blockstore::BlockStore;
use peerfs_protocol::Datagram;

/// A datagram held until every earlier sequence number is committed.
#[derive(Debug)]
struct Pending {
    block_number: u16,
    data: Bytes,
    is_end: bool,
}

#[derive(Debug)]
struct Session {
    file_name: String,
    division_size: u16,
    start_seq: u16,
    start_block: u16,
    committed: u16,
    committed_blocks: u16,
    buffered: BTreeMap<u16, Pending>,
    last_activity: Instant,
    finished: bool,
}

impl Session {
    fn new(name: &str, division_size: u16, seq: u16, block_number: u16, now: Instant) -> Self {
        Self {
            file_name: name.to_string(),
            division_size,
            start_seq: seq,
            start_block: block_number,
            committed: seq - 1,
            committed_blocks: 0,
            buffered: BTreeMap::new(),
            last_activity: now,
            finished: false,
        }
    }

    /// Whether a START with these fields retransmits this session's START
    /// rather than opening a new transfer.
    ///
    /// Senders keep one datagram in flight, so once a multi-datagram session
    /// has committed its END the sender is past its START: an identical START
    /// then belongs to a new request. A finished single-datagram session
    /// cannot tell the two apart; either way the ACK is the same.
    fn is_retransmitted_start(
        &self,
        name: &str,
        division_size: u16,
        seq: u16,
        block_number: u16,
    ) -> bool {
        let same = self.file_name == name
            && self.division_size == division_size
            && self.start_seq == seq
            && self.start_block == block_number;
        same && !(self.finished && self.committed != self.start_seq)
    }

    fn next_ack(&self) -> u16 {
        self.committed.wrapping_add(1)
    }
}

/// A receive session whose final datagram has been committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub peer: SocketAddr,
    pub file_name: String,
    pub division_size: u16,
    pub blocks: u16,
}

/// What to do after feeding one datagram to the receiver.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReceiveOutcome {
    /// ACK number to send back, `None` when the datagram is dropped silently.
    pub ack: Option<u16>,
    pub completed: Option<CompletedTransfer>,
}

impl ReceiveOutcome {
    fn dropped() -> Self {
        Self::default()
    }
}

/// All inbound sessions of one node.
#[derive(Debug)]
pub struct Receiver {
    window: u16,
    idle_timeout: Duration,
    sessions: HashMap<SocketAddr, Session>,
    /// (file name, division size) -> block count announced by a download.
    expected: HashMap<(String, u16), u16>,
}

impl Receiver {
    pub fn new(window: u16, idle_timeout: Duration) -> Self {
        Self {
            window,
            idle_timeout,
            sessions: HashMap::new(),
            expected: HashMap::new(),
        }
    }

    /// Announce how many blocks `file_name` has at `division_size`, so the
    /// last block is flagged even when it happens to be full-sized.
    pub fn expect(&mut self, file_name: &str, division_size: u16, block_count: u16) {
        self.expected
            .insert((file_name.to_string(), division_size), block_count);
    }

    pub fn forget(&mut self, file_name: &str, division_size: u16) {
        self.expected.remove(&(file_name.to_string(), division_size));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Next sequence number the session for `peer` needs.
    pub fn next_expected(&self, peer: &SocketAddr) -> Option<u16> {
        self.sessions.get(peer).map(Session::next_ack)
    }

    /// Feed one data-bearing datagram. Other datagram kinds are ignored.
    pub fn on_datagram(
        &mut self,
        peer: SocketAddr,
        datagram: &Datagram,
        now: Instant,
        store: &dyn BlockStore,
    ) -> ReceiveOutcome {
        let Some((seq, block)) = datagram.data() else {
            return ReceiveOutcome::dropped();
        };

        if let Datagram::Start { name, .. } | Datagram::StartEnd { name, .. } = datagram {
            if seq == 0 {
                tracing::debug!(%peer, "transfer: start with sequence 0, dropping");
                return ReceiveOutcome::dropped();
            }
            let duplicate = self.sessions.get(&peer).is_some_and(|s| {
                s.is_retransmitted_start(name, block.division_size, seq, block.block_number)
            });
            if !duplicate {
                if self.sessions.contains_key(&peer) {
                    tracing::debug!(%peer, file = %name, "transfer: new start supersedes running session");
                }
                self.sessions.insert(
                    peer,
                    Session::new(name, block.division_size, seq, block.block_number, now),
                );
            }
        }

        let Some(session) = self.sessions.get_mut(&peer) else {
            tracing::debug!(%peer, seq, "transfer: data without a session, dropping");
            return ReceiveOutcome::dropped();
        };
        session.last_activity = now;

        let window_end = session.committed as u32 + self.window as u32;
        if seq > session.committed && (seq as u32) <= window_end {
            session.buffered.entry(seq).or_insert_with(|| Pending {
                block_number: block.block_number,
                data: block.data.clone(),
                is_end: datagram.is_end(),
            });
        } else {
            tracing::trace!(%peer, seq, committed = session.committed, "transfer: outside window, ack only");
        }

        let mut just_finished = false;
        while let Some(pending) = session.buffered.remove(&session.committed.wrapping_add(1)) {
            let hinted_last = self
                .expected
                .get(&(session.file_name.clone(), session.division_size))
                .is_some_and(|&count| count == pending.block_number);
            let is_last = hinted_last || pending.data.len() < session.division_size as usize;

            if let Err(e) = store.save_block(
                &session.file_name,
                session.division_size,
                pending.block_number,
                is_last,
                &pending.data,
            ) {
                tracing::warn!(%peer, file = %session.file_name, block = pending.block_number, "transfer: saving block failed, abandoning session: {e}");
                self.sessions.remove(&peer);
                return ReceiveOutcome::dropped();
            }

            session.committed = session.committed.wrapping_add(1);
            session.committed_blocks = session.committed_blocks.saturating_add(1);
            if pending.is_end && !session.finished {
                session.finished = true;
                just_finished = true;
            }
        }

        let completed = just_finished.then(|| CompletedTransfer {
            peer,
            file_name: session.file_name.clone(),
            division_size: session.division_size,
            blocks: session.committed_blocks,
        });
        if let Some(done) = &completed {
            tracing::info!(%peer, file = %done.file_name, division_size = done.division_size, blocks = done.blocks, "transfer: receive complete");
        }

        ReceiveOutcome {
            ack: Some(session.next_ack()),
            completed,
        }
    }

    /// Evict sessions idle for longer than the timeout. Blocks already
    /// committed stay in the store. Returns the number evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        let idle_timeout = self.idle_timeout;
        self.sessions.retain(|peer, s| {
            let keep = now.saturating_duration_since(s.last_activity) <= idle_timeout;
            if !keep {
                tracing::debug!(%peer, file = %s.file_name, committed = s.committed, "transfer: evicting idle session");
            }
            keep
        });
        before - self.sessions.len()
    }
}

//! Protocol parameters -- the timing and sizing constants both peers of a
//! transfer must agree on.
//!
//! Node-local choices (block size, directories, tracker address) are NOT part
//! of the parameter set; they live in each binary's config.

/// A versioned set of protocol-level timing and sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Parameter set identifier. Monotonically increasing.
    pub id: u16,

    // -- Reliable datagram transfer --
    /// Receive window: how far past the next expected sequence number a
    /// datagram may arrive and still be buffered.
    pub window_size: u16,
    /// Milliseconds the sender waits for an ACK before retransmitting.
    pub ack_timeout_ms: u64,
    /// Retransmissions of one datagram before the transfer is abandoned.
    pub max_retries: u32,
    /// Seconds without traffic before a receive session is evicted.
    pub session_idle_timeout_secs: u64,
    /// Largest datagram we send or accept (UDP payload limit over IPv4).
    pub max_datagram_bytes: usize,

    // -- Tracker stream --
    /// Largest single tracker message the codec will buffer.
    pub max_message_bytes: usize,
    /// Seconds a tracker connection may sit idle between timeout ticks.
    pub tracker_idle_timeout_secs: u64,
    /// Seconds a node waits for the tracker to answer one request.
    pub node_read_timeout_secs: u64,

    // -- Block sets --
    /// Runs longer than this are sent as (first, last) sequences.
    pub max_residual_run: usize,
    /// Sequence count is a u8 on the wire.
    pub max_sequences: usize,
}

/// Version 1 parameters.
///
/// Tuned for short point-to-point transfers on a LAN: a handful of datagrams
/// in flight, sub-second retransmission, aggressive session reaping.
pub const PARAMS_V1: ProtocolParams = ProtocolParams {
    id: 1,

    // Reliable datagram transfer
    window_size: 5,
    ack_timeout_ms: 500,
    max_retries: 5,
    session_idle_timeout_secs: 30,
    max_datagram_bytes: 65_507,

    // Tracker stream
    max_message_bytes: 16 * 1024 * 1024,
    tracker_idle_timeout_secs: 60,
    node_read_timeout_secs: 10,

    // Block sets
    max_residual_run: 3,
    max_sequences: u8::MAX as usize,
};

/// Header bytes of the largest data-bearing datagram, excluding the payload:
/// tag, seq, name (str8, max length), division, block, data length.
pub const MAX_DATA_HEADER_BYTES: usize = 1 + 2 + 1 + crate::MAX_STR8_LEN + 2 + 2 + 4;

impl ProtocolParams {
    /// Largest block payload that still fits a single datagram.
    pub const fn max_block_payload(&self) -> usize {
        self.max_datagram_bytes - MAX_DATA_HEADER_BYTES
    }
}

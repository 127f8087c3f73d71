//! peerfs Protocol -- wire types and codecs for the tracker and peer datagrams.
//!
//! Two protocols share the same encoding rules (big-endian, explicit length
//! prefixes, one leading action byte):
//!   - tracker protocol over TCP, framed by `codec::TrackerCodec` / `codec::NodeCodec`
//!   - peer protocol over UDP, one `datagram::Datagram` per packet

pub mod blocks;
pub mod buf;
pub mod codec;
pub mod datagram;
pub mod messages;
pub mod params;

pub use blocks::BlockSet;
pub use codec::{NodeCodec, TrackerCodec};
pub use datagram::{DataBlock, Datagram};
pub use messages::*;
pub use params::{ProtocolParams, PARAMS_V1};

use serde::{Deserialize, Serialize};

/// Host identity: resolved hostname or address string, primary key of a node.
pub type HostId = String;

/// Hex-encoded SHA-256 content hash of a file.
pub type FileHash = String;

/// Longest name or host identity a `str8` field can carry.
pub const MAX_STR8_LEN: usize = u8::MAX as usize;

/// Longest hash a `str16` field can carry.
pub const MAX_STR16_LEN: usize = u16::MAX as usize;

/// Status code carried by every tracker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    InvalidRequest = 1,
    InvalidAction = 2,
    NotFound = 3,
    ServerError = 4,
    FileNotFound = 13,
    BlockNotFound = 14,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Status::Success,
            1 => Status::InvalidRequest,
            2 => Status::InvalidAction,
            3 => Status::NotFound,
            4 => Status::ServerError,
            13 => Status::FileNotFound,
            14 => Status::BlockNotFound,
            other => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "unknown status code {other}"
                )))
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: truncated (need {needed} bytes, have {available})")]
    Truncated { needed: usize, available: usize },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("invalid action tag: {0:#04x}")]
    InvalidAction(u8),
    #[error("field too long: {field} is {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for every decode failure caused by the bytes themselves
    /// (truncation or invalid content).
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated { .. } | ProtocolError::MalformedMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

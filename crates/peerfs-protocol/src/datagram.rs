//! Peer datagram protocol: one message per UDP packet.

use bytes::{BufMut, Bytes, BytesMut};

use crate::blocks::BlockSet;
use crate::buf::{put_str16, put_str8, WireReader};
use crate::params::PARAMS_V1;
use crate::{FileHash, ProtocolError, Result};

pub const START_DATA: u8 = 0;
pub const START_END_DATA: u8 = 1;
pub const END_DATA: u8 = 2;
pub const DATA: u8 = 3;
pub const GET_FULL_FILE: u8 = 4;
pub const GET_PARTIAL_FILE: u8 = 5;
pub const ACK: u8 = 6;

/// Payload of a data-bearing datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub division_size: u16,
    pub block_number: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// First datagram of a transfer; names the file being sent.
    Start {
        seq: u16,
        name: String,
        block: DataBlock,
    },
    /// Single-datagram transfer.
    StartEnd {
        seq: u16,
        name: String,
        block: DataBlock,
    },
    Data {
        seq: u16,
        block: DataBlock,
    },
    End {
        seq: u16,
        block: DataBlock,
    },
    GetFull {
        hash: FileHash,
        division_size: u16,
    },
    GetPartial {
        hash: FileHash,
        division_size: u16,
        blocks: BlockSet,
    },
    /// Cumulative: the next sequence number the receiver needs.
    Ack {
        ack: u16,
    },
}

impl Datagram {
    pub fn tag(&self) -> u8 {
        match self {
            Datagram::Start { .. } => START_DATA,
            Datagram::StartEnd { .. } => START_END_DATA,
            Datagram::End { .. } => END_DATA,
            Datagram::Data { .. } => DATA,
            Datagram::GetFull { .. } => GET_FULL_FILE,
            Datagram::GetPartial { .. } => GET_PARTIAL_FILE,
            Datagram::Ack { .. } => ACK,
        }
    }

    /// Sequence number and block of a data-bearing datagram.
    pub fn data(&self) -> Option<(u16, &DataBlock)> {
        match self {
            Datagram::Start { seq, block, .. }
            | Datagram::StartEnd { seq, block, .. }
            | Datagram::Data { seq, block }
            | Datagram::End { seq, block } => Some((*seq, block)),
            _ => None,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Datagram::Start { .. } | Datagram::StartEnd { .. })
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Datagram::End { .. } | Datagram::StartEnd { .. })
    }

    pub fn encode(&self) -> Result<BytesMut> {
        let mut dst = BytesMut::new();
        dst.put_u8(self.tag());
        match self {
            Datagram::Start { seq, name, block } | Datagram::StartEnd { seq, name, block } => {
                dst.put_u16(*seq);
                put_str8(&mut dst, "file name", name)?;
                put_block(&mut dst, block)?;
            }
            Datagram::Data { seq, block } | Datagram::End { seq, block } => {
                dst.put_u16(*seq);
                put_block(&mut dst, block)?;
            }
            Datagram::GetFull {
                hash,
                division_size,
            } => {
                put_str16(&mut dst, "file hash", hash)?;
                dst.put_u16(*division_size);
            }
            Datagram::GetPartial {
                hash,
                division_size,
                blocks,
            } => {
                put_str16(&mut dst, "file hash", hash)?;
                dst.put_u16(*division_size);
                blocks.encode(&mut dst)?;
            }
            Datagram::Ack { ack } => dst.put_u16(*ack),
        }

        if dst.len() > PARAMS_V1.max_datagram_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: dst.len(),
                max: PARAMS_V1.max_datagram_bytes,
            });
        }
        Ok(dst)
    }

    /// Decode one whole datagram. Trailing bytes are malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let datagram = match r.u8()? {
            START_DATA => Datagram::Start {
                seq: r.u16()?,
                name: r.str8("file name")?,
                block: read_block(&mut r)?,
            },
            START_END_DATA => Datagram::StartEnd {
                seq: r.u16()?,
                name: r.str8("file name")?,
                block: read_block(&mut r)?,
            },
            END_DATA => Datagram::End {
                seq: r.u16()?,
                block: read_block(&mut r)?,
            },
            DATA => Datagram::Data {
                seq: r.u16()?,
                block: read_block(&mut r)?,
            },
            GET_FULL_FILE => Datagram::GetFull {
                hash: r.str16("file hash")?,
                division_size: r.u16()?,
            },
            GET_PARTIAL_FILE => Datagram::GetPartial {
                hash: r.str16("file hash")?,
                division_size: r.u16()?,
                blocks: BlockSet::decode(&mut r)?,
            },
            ACK => Datagram::Ack { ack: r.u16()? },
            other => return Err(ProtocolError::InvalidAction(other)),
        };
        r.finish()?;
        Ok(datagram)
    }
}

fn put_block(dst: &mut BytesMut, block: &DataBlock) -> Result<()> {
    let len = u32::try_from(block.data.len()).map_err(|_| ProtocolError::FieldTooLong {
        field: "block data",
        len: block.data.len(),
        max: u32::MAX as usize,
    })?;
    dst.put_u16(block.division_size);
    dst.put_u16(block.block_number);
    dst.put_u32(len);
    dst.put_slice(&block.data);
    Ok(())
}

fn read_block(r: &mut WireReader<'_>) -> Result<DataBlock> {
    let division_size = r.u16()?;
    let block_number = r.u16()?;
    let len = r.u32()? as usize;
    let data = Bytes::copy_from_slice(r.take(len)?);
    Ok(DataBlock {
        division_size,
        block_number,
        data,
    })
}

//! Bounds-checked primitives shared by every encoder and decoder.
//!
//! Decoding never slices past the received buffer: each read checks the
//! remaining length first and fails with `ProtocolError::Truncated`.

use bytes::{BufMut, BytesMut};

use crate::{ProtocolError, Result};

/// Cursor over a received buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// u8 length prefix + UTF-8 bytes.
    pub fn str8(&mut self, field: &'static str) -> Result<String> {
        let len = self.u8()? as usize;
        self.utf8(field, len)
    }

    /// u16 length prefix + UTF-8 bytes.
    pub fn str16(&mut self, field: &'static str) -> Result<String> {
        let len = self.u16()? as usize;
        self.utf8(field, len)
    }

    fn utf8(&mut self, field: &'static str, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::MalformedMessage(format!("{field} is not valid UTF-8")))
    }

    /// Fail if anything is left over (datagrams must be consumed exactly).
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::MalformedMessage(format!(
                "{n} trailing bytes"
            ))),
        }
    }
}

pub fn checked_u8(field: &'static str, n: usize) -> Result<u8> {
    u8::try_from(n).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: n,
        max: u8::MAX as usize,
    })
}

pub fn checked_u16(field: &'static str, n: usize) -> Result<u16> {
    u16::try_from(n).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: n,
        max: u16::MAX as usize,
    })
}

pub fn put_str8(dst: &mut BytesMut, field: &'static str, s: &str) -> Result<()> {
    let len = checked_u8(field, s.len())?;
    dst.put_u8(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_str16(dst: &mut BytesMut, field: &'static str, s: &str) -> Result<()> {
    let len = checked_u16(field, s.len())?;
    dst.put_u16(len);
    dst.put_slice(s.as_bytes());
    Ok(())
}

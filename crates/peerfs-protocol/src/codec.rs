//! Stream codecs for the tracker protocol.
//!
//! Messages carry no outer length prefix: the decoder attempts a parse of the
//! buffered bytes and waits for more when the message is still incomplete.
//! `TrackerCodec` is the tracker side (decodes requests, encodes responses),
//! `NodeCodec` the node side.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::buf::WireReader;
use crate::messages::{Request, Response};
use crate::params::PARAMS_V1;
use crate::{ProtocolError, Result};

fn decode_frame<T>(
    src: &mut BytesMut,
    max: usize,
    parse: impl FnOnce(&mut WireReader<'_>) -> Result<T>,
) -> Result<Option<T>> {
    if src.is_empty() {
        return Ok(None);
    }

    let outcome = {
        let mut r = WireReader::new(&src[..]);
        parse(&mut r).map(|item| (item, r.position()))
    };

    match outcome {
        Ok((item, used)) => {
            src.advance(used);
            Ok(Some(item))
        }
        Err(ProtocolError::Truncated { needed, .. }) => {
            tracing::trace!(buffered = src.len(), needed, "codec: waiting for more bytes");
            if src.len() > max {
                return Err(ProtocolError::MessageTooLarge {
                    size: src.len(),
                    max,
                });
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Tracker side of a node connection.
///
/// Counts every action byte it reads, valid or not, so responses can echo
/// the counter of the request they answer.
#[derive(Debug)]
pub struct TrackerCodec {
    counter: u16,
    max_message_bytes: usize,
}

impl TrackerCodec {
    pub fn new() -> Self {
        Self {
            counter: 0,
            max_message_bytes: PARAMS_V1.max_message_bytes,
        }
    }

    /// Counter of the most recently read request.
    pub fn counter(&self) -> u16 {
        self.counter
    }
}

impl Default for TrackerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TrackerCodec {
    type Item = Request;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let result = decode_frame(src, self.max_message_bytes, Request::decode);
        if !matches!(result, Ok(None)) {
            self.counter = self.counter.wrapping_add(1);
        }
        result
    }
}

impl Encoder<Response> for TrackerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<()> {
        // Encode aside so a failed encode leaves nothing half-written.
        let bytes = item.to_bytes()?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Node side of the tracker connection.
#[derive(Debug)]
pub struct NodeCodec {
    max_message_bytes: usize,
}

impl NodeCodec {
    pub fn new() -> Self {
        Self {
            max_message_bytes: PARAMS_V1.max_message_bytes,
        }
    }
}

impl Default for NodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NodeCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        decode_frame(src, self.max_message_bytes, Response::decode)
    }
}

impl Encoder<Request> for NodeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<()> {
        let bytes = item.to_bytes()?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

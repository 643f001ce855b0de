//! Field primitives and the length-prefixed frame codec.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame payload size (16 MiB). Prevents a bogus length prefix
/// from turning into a memory-exhaustion allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors surfaced by the wire layer and the message catalogs.
///
/// Catalog decode errors never tear down a connection: the transport layer
/// logs them and drops the single offending frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("payload truncated: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },

    #[error("string field is not valid UTF-8")]
    InvalidString(#[from] std::string::FromUtf8Error),

    #[error("frame length {0} exceeds maximum of {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("invalid {0} field")]
    InvalidField(&'static str),

    #[error("failed to decompress search response: {0}")]
    Decompress(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cursor over a frame payload.
///
/// All integers are little-endian, strings are `[u32 length][UTF-8 bytes]`,
/// and IPv4 addresses travel in reversed octet order.
pub struct MessageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.remaining() < n {
            return Err(ProtoError::UnexpectedEof {
                needed: n - self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_string(&mut self) -> Result<String, ProtoError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Reads a 4-byte correlation token.
    pub fn read_token(&mut self) -> Result<crate::Token, ProtoError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(crate::Token(bytes))
    }

    /// Reads an IPv4 address transmitted in reversed (little-endian) octet
    /// order: `a.b.c.d` travels as `[d, c, b, a]`.
    pub fn read_ipv4(&mut self) -> Result<Ipv4Addr, ProtoError> {
        Ok(Ipv4Addr::from(self.read_u32()?))
    }

    /// Everything not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Builds a frame payload. The frame length prefix is added by the codec,
/// not here.
#[derive(Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn write_token(&mut self, token: crate::Token) -> &mut Self {
        self.buf.put_slice(&token.0);
        self
    }

    /// Writes an IPv4 address in reversed octet order (see
    /// [`MessageReader::read_ipv4`]).
    pub fn write_ipv4(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.buf.put_u32_le(u32::from(addr));
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Splits a byte stream into `[u32 LE length][payload]` frames and back.
///
/// Partial frames are buffered across calls; multiple complete frames in a
/// single chunk are emitted one by one, in order. `decode` yields the
/// payload with the length prefix already stripped.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, ProtoError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(len));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), ProtoError> {
        dst.reserve(4 + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

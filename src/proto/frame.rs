//! Length-prefixed frame encoding and decoding
//!
//! [`MessageBuilder`] writes an opcode and a sequence of primitive fields,
//! then prepends the little-endian length on [`MessageBuilder::build`].
//! [`MessageReader`] is the mirror: it consumes the opcode first and then
//! yields typed fields, failing with `MessageRead` when a declared length
//! would run past the payload.

use crate::error::{Error, Result};
use crate::proto::{DistributedCode, PeerCode, PeerInitCode, ServerCode};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::net::Ipv4Addr;

/// Compress with zlib at the default level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Compression(e.to_string()))
}

/// Inflate a zlib stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(e.to_string()))?;
    Ok(out)
}

/// Incrementally builds one frame: opcode, then positional fields.
#[derive(Debug)]
pub struct MessageBuilder {
    /// Opcode width in bytes; the compressed region starts after it.
    code_width: usize,
    buf: BytesMut,
}

impl MessageBuilder {
    pub fn server(code: ServerCode) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(code as u32);
        Self { code_width: 4, buf }
    }

    pub fn peer(code: PeerCode) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(code as u32);
        Self { code_width: 4, buf }
    }

    pub fn peer_init(code: PeerInitCode) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(code as u8);
        Self { code_width: 1, buf }
    }

    pub fn distributed(code: DistributedCode) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(code as u8);
        Self { code_width: 1, buf }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn i64(mut self, v: i64) -> Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn bool(mut self, v: bool) -> Self {
        self.buf.put_u8(v as u8);
        self
    }

    /// u32 length followed by the raw bytes of the string.
    pub fn string(mut self, s: &str) -> Self {
        self.buf.put_u32_le(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        self
    }

    /// Four octets in reversed order, so that a little-endian u32 read of the
    /// payload yields the address in network order. Historical quirk of the
    /// protocol; the reader mirrors it.
    pub fn ip(mut self, v: Ipv4Addr) -> Self {
        let mut octets = v.octets();
        octets.reverse();
        self.buf.put_slice(&octets);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Run zlib over everything after the opcode.
    pub fn compress(mut self) -> Result<Self> {
        let compressed = compress(&self.buf[self.code_width..])?;
        self.buf.truncate(self.code_width);
        self.buf.put_slice(&compressed);
        Ok(self)
    }

    /// Prepend the length prefix and return the finished frame.
    pub fn build(self) -> Bytes {
        let mut frame = BytesMut::with_capacity(4 + self.buf.len());
        frame.put_u32_le(self.buf.len() as u32);
        frame.put_slice(&self.buf);
        frame.freeze()
    }
}

/// Reads positional fields out of one frame body (length prefix stripped).
#[derive(Debug)]
pub struct MessageReader {
    buf: Bytes,
    pos: usize,
}

impl MessageReader {
    pub fn new(body: Bytes) -> Self {
        Self { buf: body, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::MessageRead {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a 4-byte opcode for the server or peer channel.
    pub fn code_u32(&mut self) -> Result<u32> {
        self.u32()
    }

    /// Read a 1-byte opcode for the distributed or peer-init channel.
    pub fn code_u8(&mut self) -> Result<u8> {
        self.u8()
    }

    /// Read the 4-byte opcode and fail unless it matches `expected`.
    pub fn expect_code_u32(&mut self, expected: u32) -> Result<()> {
        let actual = self.code_u32()?;
        if actual != expected {
            return Err(Error::OpcodeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Read the 1-byte opcode and fail unless it matches `expected`.
    pub fn expect_code_u8(&mut self, expected: u8) -> Result<()> {
        let actual = self.code_u8()?;
        if actual != expected {
            return Err(Error::OpcodeMismatch {
                expected: expected.into(),
                actual: actual.into(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    /// u32 length followed by UTF-8 bytes. Non-UTF-8 bytes are replaced
    /// rather than rejected; remote clients are not uniformly well-behaved.
    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Mirror of [`MessageBuilder::ip`]: four reversed octets.
    pub fn ip(&mut self) -> Result<Ipv4Addr> {
        let bytes = self.take(4)?;
        Ok(Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]))
    }

    /// Inflate everything after the current position and continue reading
    /// from the start of the inflated bytes.
    pub fn decompress(&mut self) -> Result<()> {
        let inflated = decompress(&self.buf[self.pos..])?;
        self.buf = Bytes::from(inflated);
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_round_trip() {
        let frame = MessageBuilder::server(ServerCode::Login)
            .u8(7)
            .u32(0xDEAD_BEEF)
            .i64(-42)
            .bool(true)
            .string("héllo")
            .ip(Ipv4Addr::new(192, 168, 1, 250))
            .build();

        // length prefix counts opcode + payload
        let declared = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - 4);

        let mut reader = MessageReader::new(frame.slice(4..));
        reader.expect_code_u32(ServerCode::Login as u32).unwrap();
        assert_eq!(reader.u8().unwrap(), 7);
        assert_eq!(reader.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.i64().unwrap(), -42);
        assert!(reader.bool().unwrap());
        assert_eq!(reader.string().unwrap(), "héllo");
        assert_eq!(reader.ip().unwrap(), Ipv4Addr::new(192, 168, 1, 250));
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_opcode_mismatch() {
        let frame = MessageBuilder::server(ServerCode::Ping).build();
        let mut reader = MessageReader::new(frame.slice(4..));
        let err = reader.expect_code_u32(ServerCode::Login as u32).unwrap_err();
        assert!(matches!(
            err,
            Error::OpcodeMismatch {
                expected: 1,
                actual: 32
            }
        ));
    }

    #[test]
    fn test_short_read_fails() {
        let frame = MessageBuilder::peer(PeerCode::SharesRequest).u32(1).build();
        let mut reader = MessageReader::new(frame.slice(4..));
        reader.code_u32().unwrap();
        reader.u32().unwrap();
        assert!(matches!(reader.i64(), Err(Error::MessageRead { .. })));
    }

    #[test]
    fn test_declared_string_length_past_payload() {
        // string claims 100 bytes but only 3 follow
        let frame = MessageBuilder::peer(PeerCode::QueueDownload)
            .u32(100)
            .raw(b"abc")
            .build();
        let mut reader = MessageReader::new(frame.slice(4..));
        reader.code_u32().unwrap();
        assert!(matches!(
            reader.string(),
            Err(Error::MessageRead {
                needed: 100,
                remaining: 3
            })
        ));
    }

    #[test]
    fn test_compress_round_trip() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let deflated = compress(&payload).unwrap();
        assert!(deflated.len() < payload.len());
        assert_eq!(decompress(&deflated).unwrap(), payload);
    }

    #[test]
    fn test_compressed_frame_round_trip() {
        let frame = MessageBuilder::peer(PeerCode::SharesResponse)
            .string("some directory listing")
            .u32(12345)
            .compress()
            .unwrap()
            .build();

        let mut reader = MessageReader::new(frame.slice(4..));
        reader
            .expect_code_u32(PeerCode::SharesResponse as u32)
            .unwrap();
        reader.decompress().unwrap();
        assert_eq!(reader.string().unwrap(), "some directory listing");
        assert_eq!(reader.u32().unwrap(), 12345);
    }

    #[test]
    fn test_corrupt_zlib_fails() {
        let mut reader = MessageReader::new(Bytes::from_static(&[0xFF, 0xFF, 0x00, 0x01]));
        assert!(matches!(reader.decompress(), Err(Error::Compression(_))));
    }
}

//! Byte stream codec
//!
//! Saved games and comms envelopes are written as a flat big-endian byte
//! stream. Strings are length-prefixed with a single byte; variable-length
//! integers use seven bits per byte, low group first, high bit set on every
//! byte but the last.

use crate::errors::{Result, StreamError};

/// Stream versions that change the persisted layout
pub mod version {
    /// Address records carry a single ordinal rather than a type set
    pub const SINGLE_ADDR_TYPE: u8 = 1;
    /// Address records carry a type bit set
    pub const MULTI_ADDR: u8 = 2;
    /// Per-type disable switches are persisted
    pub const DISABLED_TYPES: u8 = 3;
    /// Current layout
    pub const CURRENT: u8 = DISABLED_TYPES;
}

// ----------------------------------------------------------------------------
// Output Stream
// ----------------------------------------------------------------------------

/// Growable output buffer
#[derive(Debug, Clone, Default)]
pub struct OutStream {
    buf: Vec<u8>,
    version: u8,
}

impl OutStream {
    pub fn new() -> Self {
        Self::with_version(version::CURRENT)
    }

    pub fn with_version(version: u8) -> Self {
        Self {
            buf: Vec::new(),
            version,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32_vl(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                break;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// Write a string with a one-byte length prefix
    pub fn put_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(StreamError::StringTooLong { len: bytes.len() }.into());
        }
        self.buf.push(bytes.len() as u8);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a byte slice with a varint length prefix
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32_vl(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ----------------------------------------------------------------------------
// Input Stream
// ----------------------------------------------------------------------------

/// Cursor over a borrowed byte slice
#[derive(Debug, Clone)]
pub struct InStream<'a> {
    data: &'a [u8],
    pos: usize,
    version: u8,
}

impl<'a> InStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_version(data, version::CURRENT)
    }

    pub fn with_version(data: &'a [u8], version: u8) -> Self {
        Self {
            data,
            pos: 0,
            version,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(StreamError::UnexpectedEof { needed, remaining }.into());
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32_vl(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.get_u8()?;
            let bits = (byte & 0x7F) as u32;
            if shift == 28 && bits > 0x0F {
                return Err(StreamError::VarintOverflow.into());
            }
            result |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(StreamError::VarintOverflow.into())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StreamError::InvalidUtf8.into())
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32_vl()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CommsError;

    #[test]
    fn fixed_width_is_big_endian() {
        let mut out = OutStream::new();
        out.put_u16(0x1234);
        out.put_u32(0xDEADBEEF);
        assert_eq!(out.as_bytes(), &[0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn varint_layout() {
        let mut out = OutStream::new();
        out.put_u32_vl(5);
        out.put_u32_vl(300);
        assert_eq!(out.as_bytes(), &[0x05, 0xAC, 0x02]);

        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        assert_eq!(input.get_u32_vl().unwrap(), 5);
        assert_eq!(input.get_u32_vl().unwrap(), 300);
        assert!(input.is_empty());
    }

    #[test]
    fn varint_overflow_is_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let err = InStream::new(&bytes).get_u32_vl().unwrap_err();
        assert!(matches!(err, CommsError::Stream(StreamError::VarintOverflow)));
    }

    #[test]
    fn short_read_reports_eof() {
        let bytes = [0x01];
        let err = InStream::new(&bytes).get_u32().unwrap_err();
        assert!(matches!(
            err,
            CommsError::Stream(StreamError::UnexpectedEof {
                needed: 4,
                remaining: 1
            })
        ));
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut out = OutStream::new();
        out.put_string("room").unwrap();
        out.put_string("").unwrap();
        assert_eq!(&out.as_bytes()[..5], &[4, b'r', b'o', b'o', b'm']);

        let long = "x".repeat(300);
        assert!(out.put_string(&long).is_err());

        let bytes = out.into_bytes();
        let mut input = InStream::new(&bytes);
        assert_eq!(input.get_string().unwrap(), "room");
        assert_eq!(input.get_string().unwrap(), "");
    }
}

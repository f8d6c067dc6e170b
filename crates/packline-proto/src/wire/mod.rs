//! Payload value encoding.
//!
//! Packet headers are raw binary for routing speed; payload *contents* are
//! encoded through this module. All primitives are Little Endian, strings
//! are UTF-8 with a 16-bit byte-count prefix (the count `65535` is the null
//! sentinel), and nullable value types carry a one-byte present/absent flag.
//!
//! The [`registry`] submodule maps Rust types to their formatter pair so the
//! serializer stays generic without per-field reflection.

pub mod registry;

use bytes::{BufMut, Bytes, BytesMut};

pub use registry::{Formatter, FormatterRegistry, global};

use crate::errors::{ProtocolError, Result};

/// Default maximum encoded string length in bytes.
///
/// `65535` is reserved as the null sentinel, so the largest representable
/// string is one byte shorter.
pub const DEFAULT_MAX_STRING: usize = u16::MAX as usize - 1;

/// Byte-count sentinel denoting a null string.
const NULL_STRING: u16 = u16::MAX;

/// Growable Little Endian payload writer.
#[derive(Debug)]
pub struct WireWriter {
    buf: BytesMut,
    max_string: usize,
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl WireWriter {
    /// Create a writer with the default string limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_string(DEFAULT_MAX_STRING)
    }

    /// Create a writer with an explicit string limit.
    #[must_use]
    pub fn with_max_string(max_string: usize) -> Self {
        Self { buf: BytesMut::new(), max_string: max_string.min(DEFAULT_MAX_STRING) }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and take the encoded bytes.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Write an unsigned 8-bit integer.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Write an unsigned 16-bit integer.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    /// Write an unsigned 32-bit integer.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    /// Write an unsigned 64-bit integer.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    /// Write a signed 8-bit integer.
    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    /// Write a signed 16-bit integer.
    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16_le(v);
    }

    /// Write a signed 32-bit integer.
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    /// Write a signed 64-bit integer.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    /// Write a 32-bit float.
    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    /// Write a 64-bit float.
    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Write a boolean as one byte (0 or 1).
    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    /// Write raw bytes without a length prefix.
    pub fn put_slice(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Write a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::SerializationLimit`] if the UTF-8 byte count
    ///   exceeds the configured maximum.
    pub fn put_str(&mut self, s: &str) -> Result<()> {
        let len = s.len();
        if len > self.max_string {
            return Err(ProtocolError::SerializationLimit { len, max: self.max_string });
        }

        self.buf.put_u16_le(len as u16);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    /// Write a nullable string: the null sentinel, or the string encoding.
    pub fn put_opt_str(&mut self, s: Option<&str>) -> Result<()> {
        match s {
            None => {
                self.buf.put_u16_le(NULL_STRING);
                Ok(())
            },
            Some(s) => self.put_str(s),
        }
    }
}

/// Bounds-checked Little Endian payload reader.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    max_string: usize,
}

impl<'a> WireReader<'a> {
    /// Create a reader over encoded payload bytes.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_max_string(buf, DEFAULT_MAX_STRING)
    }

    /// Create a reader with an explicit string limit.
    #[must_use]
    pub fn with_max_string(buf: &'a [u8], max_string: usize) -> Self {
        Self { buf, max_string: max_string.min(DEFAULT_MAX_STRING) }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(ProtocolError::ShortFrame { expected: n, actual: self.buf.len() });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }

    /// Read an unsigned 8-bit integer.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read an unsigned 16-bit integer.
    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read an unsigned 32-bit integer.
    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read an unsigned 64-bit integer.
    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read a signed 8-bit integer.
    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(self.take_array::<1>()?[0] as i8)
    }

    /// Read a signed 16-bit integer.
    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    /// Read a signed 32-bit integer.
    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read a signed 64-bit integer.
    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a 32-bit float.
    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a 64-bit float.
    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Read a boolean. Any nonzero byte is true.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read a nullable length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::SerializationLimit`] if the byte count exceeds the
    ///   configured maximum.
    /// - [`ProtocolError::InvalidString`] if the bytes are not UTF-8.
    /// - [`ProtocolError::ShortFrame`] on buffer underrun.
    pub fn get_opt_str(&mut self) -> Result<Option<String>> {
        let count = self.get_u16()?;
        if count == NULL_STRING {
            return Ok(None);
        }

        let len = count as usize;
        if len > self.max_string {
            return Err(ProtocolError::SerializationLimit { len, max: self.max_string });
        }

        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)?;
        Ok(Some(s.to_owned()))
    }

    /// Read a non-nullable string; the null sentinel is an error here.
    pub fn get_str(&mut self) -> Result<String> {
        self.get_opt_str()?.ok_or(ProtocolError::InvalidString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_little_endian() {
        let mut w = WireWriter::new();
        w.put_u16(0x0102);
        w.put_u32(0x0304_0506);
        w.put_i64(-2);
        w.put_bool(true);

        let bytes = w.freeze();
        assert_eq!(&bytes[0..2], &[0x02, 0x01]);
        assert_eq!(&bytes[2..6], &[0x06, 0x05, 0x04, 0x03]);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_u16().unwrap(), 0x0102);
        assert_eq!(r.get_u32().unwrap(), 0x0304_0506);
        assert_eq!(r.get_i64().unwrap(), -2);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_round_trip() {
        let mut w = WireWriter::new();
        w.put_str("héllo").unwrap();

        let bytes = w.freeze();
        assert_eq!(&bytes[0..2], &(6u16.to_le_bytes()));

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_str().unwrap(), "héllo");
    }

    #[test]
    fn null_string_sentinel() {
        let mut w = WireWriter::new();
        w.put_opt_str(None).unwrap();
        let bytes = w.freeze();
        assert_eq!(&bytes[..], &[0xFF, 0xFF]);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_opt_str().unwrap(), None);
    }

    #[test]
    fn max_count_minus_one_is_a_real_string() {
        let s = "x".repeat(u16::MAX as usize - 1);
        let mut w = WireWriter::new();
        w.put_str(&s).unwrap();

        let mut bytes = w.freeze();
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_str().unwrap().len(), u16::MAX as usize - 1);

        // One more byte of count flips into the null sentinel space.
        bytes = {
            let mut v = bytes.to_vec();
            v[0] = 0xFF;
            v[1] = 0xFF;
            Bytes::from(v)
        };
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_opt_str().unwrap(), None);
    }

    #[test]
    fn string_over_limit_fails() {
        let mut w = WireWriter::with_max_string(8);
        let result = w.put_str("more than eight");
        assert_eq!(result, Err(ProtocolError::SerializationLimit { len: 15, max: 8 }));

        let mut long = WireWriter::new();
        long.put_str("more than eight").unwrap();
        let bytes = long.freeze();

        let mut r = WireReader::with_max_string(&bytes, 8);
        assert_eq!(r.get_opt_str(), Err(ProtocolError::SerializationLimit { len: 15, max: 8 }));
    }

    #[test]
    fn underrun_is_a_short_frame() {
        let mut r = WireReader::new(&[0x01]);
        assert_eq!(r.get_u32(), Err(ProtocolError::ShortFrame { expected: 4, actual: 1 }));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&[0xC0, 0x80]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.get_opt_str(), Err(ProtocolError::InvalidString));
    }
}

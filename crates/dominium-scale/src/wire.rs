// SPDX-License-Identifier: Apache-2.0
//! Big-endian wire primitives shared by the capsule codec and the store
//! containers.
//!
//! All fixed-width integers in persisted artifacts are big-endian.
//! Strings are `u32` length prefixes followed by raw UTF-8 bytes.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Errors raised while decoding a wire artifact.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before a field could be read.
    #[error("truncated input at offset {0}")]
    Truncated(usize),
    /// Input had bytes left after the last expected field.
    #[error("{0} trailing bytes after end of artifact")]
    TrailingBytes(usize),
    /// A version field did not match the supported version.
    #[error("unsupported version {found}, expected {expected}")]
    UnsupportedVersion {
        /// Version read from the artifact.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
    /// A length prefix exceeded the bytes remaining.
    #[error("length {len} exceeds remaining {remaining} bytes")]
    LengthOutOfBounds {
        /// Declared length.
        len: usize,
        /// Bytes remaining in the input.
        remaining: usize,
    },
    /// A string field held invalid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    /// A string exceeded its bounded capacity.
    #[error("string of {len} bytes exceeds cap {cap}")]
    StringTooLong {
        /// Declared length.
        len: usize,
        /// Maximum accepted length.
        cap: usize,
    },
}

/// Append-only big-endian writer over a [`BytesMut`].
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates a writer with a capacity hint.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes a `u32` big-endian.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Writes a `u64` big-endian.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Writes an `i64` big-endian (two's complement).
    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Writes raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes a length-prefixed string.
    pub fn put_string(&mut self, text: &str) {
        self.buf.put_u32(text.len() as u32);
        self.buf.put_slice(text.as_bytes());
    }

    /// Writes a length-prefixed list of length-prefixed strings.
    pub fn put_string_list(&mut self, items: &[&str]) {
        self.buf.put_u32(items.len() as u32);
        for item in items {
            self.put_string(item);
        }
    }

    /// Finishes the artifact.
    #[must_use]
    pub fn finish(self) -> bytes::Bytes {
        self.buf.freeze()
    }
}

/// Serialized length of a length-prefixed string.
#[must_use]
pub fn string_len(text: &str) -> usize {
    4 + text.len()
}

/// Serialized length of a string list.
#[must_use]
pub fn string_list_len(items: &[&str]) -> usize {
    4 + items.iter().map(|s| string_len(s)).sum::<usize>()
}

/// Forward-only big-endian reader over a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current read offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.remaining()))
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated(self.pos));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads a `u32` big-endian.
    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `u64` big-endian.
    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Reads an `i64` big-endian.
    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.get_u64()? as i64)
    }

    /// Reads `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::LengthOutOfBounds {
                len,
                remaining: self.remaining(),
            });
        }
        self.take(len)
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.get_bytes(len).map(|_| ())
    }

    /// Reads a length-prefixed string, bounded by `cap` bytes.
    pub fn get_string(&mut self, cap: usize) -> Result<&'a str, WireError> {
        let len = self.get_u32()? as usize;
        if len > cap {
            return Err(WireError::StringTooLong { len, cap });
        }
        let bytes = self.get_bytes(len)?;
        core::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Skips a length-prefixed string.
    pub fn skip_string(&mut self) -> Result<(), WireError> {
        let len = self.get_u32()? as usize;
        self.skip(len)
    }

    /// Skips a string list, returning the item count.
    pub fn skip_string_list(&mut self) -> Result<u32, WireError> {
        let count = self.get_u32()?;
        for _ in 0..count {
            self.skip_string()?;
        }
        Ok(count)
    }
}

/// Reads and checks a leading version field.
pub fn check_version(reader: &mut Reader<'_>, expected: u32) -> Result<(), WireError> {
    let found = reader.get_u32()?;
    if found == expected {
        Ok(())
    } else {
        Err(WireError::UnsupportedVersion { found, expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_integers_and_strings() {
        let mut w = Writer::default();
        w.put_u32(7);
        w.put_u64(u64::MAX);
        w.put_i64(-9);
        w.put_string("hello");
        let bytes = w.finish();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.get_u32().map_err(|e| e.to_string()), Ok(7));
        assert_eq!(r.get_u64().map_err(|e| e.to_string()), Ok(u64::MAX));
        assert_eq!(r.get_i64().map_err(|e| e.to_string()), Ok(-9));
        assert_eq!(r.get_string(16).map_err(|e| e.to_string()), Ok("hello"));
        assert!(r.expect_end().is_ok());
    }

    #[test]
    fn truncated_and_trailing_are_distinct_errors() {
        let mut w = Writer::default();
        w.put_u32(1);
        let bytes = w.finish();

        let mut r = Reader::new(&bytes[..2]);
        assert!(matches!(r.get_u32(), Err(WireError::Truncated(_))));

        let mut r = Reader::new(&bytes);
        let _ = r.skip(1);
        assert!(matches!(r.expect_end(), Err(WireError::TrailingBytes(3))));
    }

    #[test]
    fn string_cap_is_enforced() {
        let mut w = Writer::default();
        w.put_string("too long for the cap");
        let bytes = w.finish();
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.get_string(4),
            Err(WireError::StringTooLong { .. })
        ));
    }

    #[test]
    fn integers_serialize_big_endian() {
        let mut w = Writer::default();
        w.put_u32(0x0102_0304);
        assert_eq!(&w.finish()[..], &[1, 2, 3, 4]);
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte buffers with variable-length integer, length-prefixed and fixed-width string primitives.
//!
//! [`WriteBuffer`] is append-only and grows on demand. [`ReadBuffer`] tracks a read position over
//! a borrowed slice and fails with [`DecodeError::BufferUnderflow`] instead of truncating when a
//! value runs past the end of the data.
//!
//! Integer encodings:
//! - `vint`/`vlong`: unsigned LEB128, 7 bits per byte, high bit marks continuation.
//! - `svint`/`svlong`: zigzag mapping onto the unsigned forms, so small negative numbers stay
//!   small.
//! - fixed-width integers are big-endian so they sort correctly as raw bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::{DecodeError, EncodeError};

/// Length written by [`WriteBuffer::put_prefixed_string`] for `None`.
pub const NULL_LENGTH: i32 = -1;

const MAX_VINT_BYTES: usize = 5;
const MAX_VLONG_BYTES: usize = 10;
const DEFAULT_CAPACITY: usize = 64;

/// Length prefix for a payload of `len` bytes. Prefixes are signed 32-bit on the wire.
fn prefix_len(len: usize) -> Result<i32, EncodeError> {
    i32::try_from(len).map_err(|_| EncodeError::TooLong {
        len,
        max: i32::MAX as usize,
    })
}

#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    buf: BytesMut,
}

impl WriteBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        WriteBuffer {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_vint(&mut self, value: u32) {
        self.put_vlong(u64::from(value));
    }

    pub fn put_vlong(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn put_svint(&mut self, value: i32) {
        self.put_vint(zigzag_encode_i32(value));
    }

    pub fn put_svlong(&mut self, value: i64) {
        self.put_vlong(zigzag_encode_i64(value));
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes the length as a zigzag varint followed by the bytes. `None` writes
    /// [`NULL_LENGTH`] and no payload.
    pub fn put_prefixed_bytes(&mut self, bytes: Option<&[u8]>) -> Result<(), EncodeError> {
        match bytes {
            Some(bytes) => {
                self.put_svint(prefix_len(bytes.len())?);
                self.buf.put_slice(bytes);
            }
            None => self.put_svint(NULL_LENGTH),
        }
        Ok(())
    }

    pub fn put_prefixed_string(&mut self, value: Option<&str>) -> Result<(), EncodeError> {
        self.put_prefixed_bytes(value.map(str::as_bytes))
    }

    /// Writes `value` NUL-padded to exactly `width` bytes.
    ///
    /// Values longer than `width` are rejected rather than truncated, since a truncated key
    /// field silently merges distinct entities.
    pub fn put_pad_string(&mut self, value: &str, width: usize) -> Result<(), EncodeError> {
        let bytes = value.as_bytes();
        if bytes.len() > width {
            return Err(EncodeError::PadOverflow {
                len: bytes.len(),
                width,
            });
        }
        self.buf.put_slice(bytes);
        self.buf.put_bytes(0, width - bytes.len());
        Ok(())
    }

    pub fn put_padded<const WIDTH: usize>(&mut self, value: &PaddedString<WIDTH>) {
        let bytes = value.as_str().as_bytes();
        self.buf.put_slice(bytes);
        self.buf.put_bytes(0, WIDTH - bytes.len());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Position-tracking reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ReadBuffer<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        ReadBuffer { data, offset: 0 }
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    #[must_use]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Returns everything not read yet and moves the position to the end.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    /// Fails unless the whole buffer has been consumed.
    pub fn expect_end(&self) -> Result<(), DecodeError> {
        if self.has_remaining() {
            return Err(DecodeError::InvalidFormat(format!(
                "{} trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::BufferUnderflow {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidFormat(format!(
                "invalid boolean byte {other}"
            ))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_vint(&mut self) -> Result<u32, DecodeError> {
        let value = self.read_varint(MAX_VINT_BYTES)?;
        u32::try_from(value)
            .map_err(|_| DecodeError::InvalidFormat(format!("vint out of range: {value}")))
    }

    pub fn read_vlong(&mut self) -> Result<u64, DecodeError> {
        self.read_varint(MAX_VLONG_BYTES)
    }

    pub fn read_svint(&mut self) -> Result<i32, DecodeError> {
        Ok(zigzag_decode_i32(self.read_vint()?))
    }

    pub fn read_svlong(&mut self) -> Result<i64, DecodeError> {
        Ok(zigzag_decode_i64(self.read_vlong()?))
    }

    fn read_varint(&mut self, max_bytes: usize) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        for index in 0..max_bytes {
            let byte = self.read_u8()?;
            let shift = 7 * index as u32;
            let bits = u64::from(byte & 0x7f);
            if shift == 63 && bits > 1 {
                return Err(DecodeError::InvalidFormat("varint overflows 64 bits".into()));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecodeError::InvalidFormat(format!(
            "varint longer than {max_bytes} bytes"
        )))
    }

    /// Reads a length-prefixed byte slice, `None` when the sentinel length was written.
    pub fn read_prefixed_bytes(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        let len = self.read_svint()?;
        if len == NULL_LENGTH {
            return Ok(None);
        }
        let len = usize::try_from(len)
            .map_err(|_| DecodeError::InvalidFormat(format!("negative length {len}")))?;
        self.read_bytes(len).map(Some)
    }

    pub fn read_prefixed_string(&mut self) -> Result<Option<String>, DecodeError> {
        match self.read_prefixed_bytes()? {
            Some(bytes) => to_string(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Reads a prefixed string that must not be the null sentinel.
    pub fn read_required_string(&mut self, field: &str) -> Result<String, DecodeError> {
        self.read_prefixed_string()?
            .ok_or_else(|| DecodeError::InvalidFormat(format!("{field} is missing")))
    }

    /// Reads a `width`-byte padded field and strips trailing NUL and space bytes.
    pub fn read_pad_string_and_right_trim(&mut self, width: usize) -> Result<String, DecodeError> {
        let bytes = self.read_bytes(width)?;
        let end = bytes
            .iter()
            .rposition(|b| *b != 0 && *b != b' ')
            .map_or(0, |pos| pos + 1);
        to_string(&bytes[..end])
    }

    pub fn read_padded<const WIDTH: usize>(&mut self) -> Result<PaddedString<WIDTH>, DecodeError> {
        let value = self.read_pad_string_and_right_trim(WIDTH)?;
        Ok(PaddedString(value))
    }
}

fn to_string(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::Utf8Error(e.to_string()))
}

#[inline]
fn zigzag_encode_i32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
fn zigzag_decode_i32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[inline]
fn zigzag_encode_i64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
fn zigzag_decode_i64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// A string guaranteed to fit a `WIDTH`-byte padded key field.
///
/// Row keys compare as raw bytes, so any field that takes part in a prefix or range scan has to
/// occupy the same number of bytes in every key. The width is checked once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaddedString<const WIDTH: usize>(String);

impl<const WIDTH: usize> PaddedString<WIDTH> {
    pub fn new(value: impl Into<String>) -> Result<Self, EncodeError> {
        let value = value.into();
        if value.len() > WIDTH {
            return Err(EncodeError::PadOverflow {
                len: value.len(),
                width: WIDTH,
            });
        }
        // Trailing padding bytes are stripped on read, so they cannot round-trip.
        if value.ends_with(['\0', ' ']) {
            return Err(EncodeError::InvalidValue(format!(
                "padded value {value:?} ends with a padding byte"
            )));
        }
        Ok(PaddedString(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub const fn width() -> usize {
        WIDTH
    }
}

impl<const WIDTH: usize> fmt::Display for PaddedString<WIDTH> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_vint_boundaries() {
        let mut buf = WriteBuffer::new();
        for value in [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX] {
            buf.put_vint(value);
        }
        let bytes = buf.freeze();
        let mut reader = ReadBuffer::new(&bytes);
        for value in [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX] {
            assert_eq!(reader.read_vint().unwrap(), value);
        }
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_small_values_take_one_byte() {
        let mut buf = WriteBuffer::new();
        buf.put_vint(127);
        assert_eq!(buf.len(), 1);
        buf.put_svint(-64);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_read_past_end_is_underflow() {
        let mut reader = ReadBuffer::new(&[0x01, 0x02]);
        assert_eq!(
            reader.read_i32(),
            Err(DecodeError::BufferUnderflow {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_truncated_varint_is_underflow() {
        let mut reader = ReadBuffer::new(&[0x80, 0x80]);
        assert!(matches!(
            reader.read_vlong(),
            Err(DecodeError::BufferUnderflow { .. })
        ));
    }

    #[test]
    fn test_overlong_vint_is_rejected() {
        let mut reader = ReadBuffer::new(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert!(matches!(
            reader.read_vint(),
            Err(DecodeError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_prefixed_string_null_and_empty() {
        let mut buf = WriteBuffer::new();
        buf.put_prefixed_string(None).unwrap();
        buf.put_prefixed_string(Some("")).unwrap();
        buf.put_prefixed_string(Some("héllo")).unwrap();
        let bytes = buf.freeze();
        let mut reader = ReadBuffer::new(&bytes);
        assert_eq!(reader.read_prefixed_string().unwrap(), None);
        assert_eq!(reader.read_prefixed_string().unwrap(), Some(String::new()));
        assert_eq!(
            reader.read_prefixed_string().unwrap(),
            Some("héllo".to_string())
        );
    }

    #[test]
    fn test_prefix_len_rejects_oversized_payloads() {
        assert_eq!(prefix_len(0), Ok(0));
        assert_eq!(prefix_len(i32::MAX as usize), Ok(i32::MAX));
        assert_eq!(
            prefix_len(i32::MAX as usize + 1),
            Err(EncodeError::TooLong {
                len: i32::MAX as usize + 1,
                max: i32::MAX as usize
            })
        );
    }

    #[test]
    fn test_prefixed_string_invalid_utf8() {
        let mut buf = WriteBuffer::new();
        buf.put_prefixed_bytes(Some(&[0xff, 0xfe])).unwrap();
        let bytes = buf.freeze();
        let mut reader = ReadBuffer::new(&bytes);
        assert!(matches!(
            reader.read_prefixed_string(),
            Err(DecodeError::Utf8Error(_))
        ));
    }

    #[test]
    fn test_pad_string_round_trip() {
        let mut buf = WriteBuffer::new();
        buf.put_pad_string("app", 8).unwrap();
        assert_eq!(buf.as_slice(), b"app\0\0\0\0\0");
        let bytes = buf.freeze();
        let mut reader = ReadBuffer::new(&bytes);
        assert_eq!(reader.read_pad_string_and_right_trim(8).unwrap(), "app");
    }

    #[test]
    fn test_pad_string_overflow_is_fatal() {
        let mut buf = WriteBuffer::new();
        assert_eq!(
            buf.put_pad_string("too-long-name", 4),
            Err(EncodeError::PadOverflow { len: 13, width: 4 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_padded_string_exact_width() {
        let value = PaddedString::<4>::new("abcd").unwrap();
        let mut buf = WriteBuffer::new();
        buf.put_padded(&value);
        assert_eq!(buf.len(), 4);
        assert!(PaddedString::<4>::new("abcde").is_err());
        assert!(PaddedString::<4>::new("ab ").is_err());
    }

    #[test]
    fn test_expect_end_rejects_trailing_bytes() {
        let mut reader = ReadBuffer::new(&[0x01, 0x02]);
        reader.read_u8().unwrap();
        assert!(reader.expect_end().is_err());
        reader.read_u8().unwrap();
        assert!(reader.expect_end().is_ok());
    }

    proptest! {
        #[test]
        fn prop_vlong_round_trip(value in any::<u64>()) {
            let mut buf = WriteBuffer::new();
            buf.put_vlong(value);
            let bytes = buf.freeze();
            let mut reader = ReadBuffer::new(&bytes);
            prop_assert_eq!(reader.read_vlong().unwrap(), value);
            prop_assert!(!reader.has_remaining());
        }

        #[test]
        fn prop_signed_varints_round_trip(int in any::<i32>(), long in any::<i64>()) {
            let mut buf = WriteBuffer::new();
            buf.put_svint(int);
            buf.put_svlong(long);
            let bytes = buf.freeze();
            let mut reader = ReadBuffer::new(&bytes);
            prop_assert_eq!(reader.read_svint().unwrap(), int);
            prop_assert_eq!(reader.read_svlong().unwrap(), long);
        }

        #[test]
        fn prop_padded_fields_sort_like_strings(a in "[a-z]{0,12}", b in "[a-z]{0,12}") {
            let mut left = WriteBuffer::new();
            left.put_pad_string(&a, 16).unwrap();
            let mut right = WriteBuffer::new();
            right.put_pad_string(&b, 16).unwrap();
            prop_assert_eq!(left.as_slice().cmp(right.as_slice()), a.cmp(&b));
        }
    }
}

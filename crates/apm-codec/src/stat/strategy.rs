// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-column encoding strategies for stat batches.
//!
//! Every field of a stat kind is written as one column over the whole batch. For each column the
//! encoder measures the candidate strategies, keeps the smallest, and records its 2-bit code in a
//! packed header. The header is written (length-prefixed) before any column so the decoder knows
//! how every column was laid out before it reads one.

use std::marker::PhantomData;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::errors::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncodingStrategy {
    /// Every value written in order.
    None = 0,
    /// `(vint run length, value)` pairs.
    RepeatCount = 1,
    /// A single value shared by the whole column.
    AlwaysSameValue = 2,
}

impl EncodingStrategy {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(EncodingStrategy::None),
            1 => Ok(EncodingStrategy::RepeatCount),
            2 => Ok(EncodingStrategy::AlwaysSameValue),
            other => Err(DecodeError::InvalidType(format!(
                "encoding strategy code {other}"
            ))),
        }
    }

    pub fn encode<C: ValueCodec>(
        self,
        buf: &mut WriteBuffer,
        values: &[C::Value],
    ) -> Result<(), EncodeError> {
        match self {
            EncodingStrategy::None => {
                for value in values {
                    C::write(buf, value)?;
                }
            }
            EncodingStrategy::RepeatCount => {
                for run in values.chunk_by(|a, b| a == b) {
                    buf.put_vint(run.len() as u32);
                    C::write(buf, &run[0])?;
                }
            }
            EncodingStrategy::AlwaysSameValue => {
                if let Some(first) = values.first() {
                    C::write(buf, first)?;
                }
            }
        }
        Ok(())
    }

    pub fn decode<C: ValueCodec>(
        self,
        buf: &mut ReadBuffer<'_>,
        count: usize,
    ) -> Result<Vec<C::Value>, DecodeError> {
        let mut values = Vec::with_capacity(count);
        match self {
            EncodingStrategy::None => {
                for _ in 0..count {
                    values.push(C::read(buf)?);
                }
            }
            EncodingStrategy::RepeatCount => {
                while values.len() < count {
                    let run = buf.read_vint()? as usize;
                    if run == 0 || run > count - values.len() {
                        return Err(DecodeError::InvalidFormat(format!(
                            "repeat count {run} with {} of {count} values decoded",
                            values.len()
                        )));
                    }
                    let value = C::read(buf)?;
                    values.extend(std::iter::repeat(value).take(run));
                }
            }
            EncodingStrategy::AlwaysSameValue => {
                if count > 0 {
                    let value = C::read(buf)?;
                    values.extend(std::iter::repeat(value).take(count));
                }
            }
        }
        Ok(values)
    }
}

/// Writes and reads a single column value.
pub trait ValueCodec {
    type Value: Clone + PartialEq;

    fn write(buf: &mut WriteBuffer, value: &Self::Value) -> Result<(), EncodeError>;
    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self::Value, DecodeError>;
}

/// Non-negative counters and codes. Negative values still round-trip but take ten bytes.
#[derive(Debug)]
pub struct UnsignedLongCodec;

impl ValueCodec for UnsignedLongCodec {
    type Value = i64;

    fn write(buf: &mut WriteBuffer, value: &i64) -> Result<(), EncodeError> {
        buf.put_vlong(*value as u64);
        Ok(())
    }

    fn read(buf: &mut ReadBuffer<'_>) -> Result<i64, DecodeError> {
        Ok(buf.read_vlong()? as i64)
    }
}

/// Values that may carry the `-1` "not collected" marker.
#[derive(Debug)]
pub struct SignedLongCodec;

impl ValueCodec for SignedLongCodec {
    type Value = i64;

    fn write(buf: &mut WriteBuffer, value: &i64) -> Result<(), EncodeError> {
        buf.put_svlong(*value);
        Ok(())
    }

    fn read(buf: &mut ReadBuffer<'_>) -> Result<i64, DecodeError> {
        buf.read_svlong()
    }
}

#[derive(Debug)]
pub struct StringCodec;

impl ValueCodec for StringCodec {
    type Value = Option<String>;

    fn write(buf: &mut WriteBuffer, value: &Option<String>) -> Result<(), EncodeError> {
        buf.put_prefixed_string(value.as_deref())
    }

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Option<String>, DecodeError> {
        buf.read_prefixed_string()
    }
}

/// Picks the strategy producing the fewest bytes for a column.
#[derive(Debug)]
pub struct StrategyAnalyzer<C>(PhantomData<C>);

impl<C: ValueCodec> StrategyAnalyzer<C> {
    #[must_use]
    pub fn choose(values: &[C::Value]) -> EncodingStrategy {
        match values.split_first() {
            None => EncodingStrategy::AlwaysSameValue,
            Some((first, rest)) if rest.iter().all(|value| value == first) => {
                EncodingStrategy::AlwaysSameValue
            }
            Some(_) => {
                let plain = Self::encoded_len(EncodingStrategy::None, values);
                let repeat = Self::encoded_len(EncodingStrategy::RepeatCount, values);
                if repeat < plain {
                    EncodingStrategy::RepeatCount
                } else {
                    EncodingStrategy::None
                }
            }
        }
    }

    /// Unencodable columns measure as `usize::MAX`; the error surfaces when the column is written.
    fn encoded_len(strategy: EncodingStrategy, values: &[C::Value]) -> usize {
        let mut scratch = WriteBuffer::new();
        match strategy.encode::<C>(&mut scratch, values) {
            Ok(()) => scratch.len(),
            Err(_) => usize::MAX,
        }
    }
}

const BITS_PER_CODE: usize = 2;
const CODES_PER_BYTE: usize = 8 / BITS_PER_CODE;

/// Packs 2-bit strategy codes, most significant pair first.
#[derive(Debug, Default)]
pub struct HeaderEncoder {
    bytes: Vec<u8>,
    codes: usize,
}

impl HeaderEncoder {
    pub fn add_code(&mut self, code: u8) {
        let slot = self.codes % CODES_PER_BYTE;
        if slot == 0 {
            self.bytes.push(0);
        }
        let shift = 8 - BITS_PER_CODE * (slot + 1);
        if let Some(last) = self.bytes.last_mut() {
            *last |= (code & 0b11) << shift;
        }
        self.codes += 1;
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug)]
pub struct HeaderDecoder<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> HeaderDecoder<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        HeaderDecoder { bytes, position: 0 }
    }

    pub fn next_code(&mut self) -> Result<u8, DecodeError> {
        let byte = self
            .bytes
            .get(self.position / CODES_PER_BYTE)
            .ok_or_else(|| DecodeError::InvalidFormat("stat header exhausted".into()))?;
        let slot = self.position % CODES_PER_BYTE;
        self.position += 1;
        Ok((byte >> (8 - BITS_PER_CODE * (slot + 1))) & 0b11)
    }
}

/// Collects the columns of one batch.
#[derive(Debug, Default)]
pub struct FieldEncoder {
    header: HeaderEncoder,
    values: WriteBuffer,
}

impl FieldEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column<C: ValueCodec>(&mut self, values: &[C::Value]) -> Result<(), EncodeError> {
        let strategy = StrategyAnalyzer::<C>::choose(values);
        self.header.add_code(strategy.code());
        strategy.encode::<C>(&mut self.values, values)
    }

    pub fn unsigned_longs(&mut self, values: &[i64]) -> Result<(), EncodeError> {
        self.column::<UnsignedLongCodec>(values)
    }

    pub fn signed_longs(&mut self, values: &[i64]) -> Result<(), EncodeError> {
        self.column::<SignedLongCodec>(values)
    }

    pub fn strings(&mut self, values: &[Option<String>]) -> Result<(), EncodeError> {
        self.column::<StringCodec>(values)
    }

    /// Writes the prefixed header followed by every column.
    pub fn finish(self, buf: &mut WriteBuffer) -> Result<(), EncodeError> {
        buf.put_prefixed_bytes(Some(self.header.as_bytes()))?;
        buf.put_bytes(self.values.as_slice());
        Ok(())
    }
}

/// Reads columns back in the order they were written.
#[derive(Debug)]
pub struct FieldDecoder<'h, 'b, 'd> {
    header: HeaderDecoder<'h>,
    buf: &'b mut ReadBuffer<'d>,
    count: usize,
}

impl<'h, 'b, 'd> FieldDecoder<'h, 'b, 'd> {
    pub fn new(header: &'h [u8], buf: &'b mut ReadBuffer<'d>, count: usize) -> Self {
        FieldDecoder {
            header: HeaderDecoder::new(header),
            buf,
            count,
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn column<C: ValueCodec>(&mut self) -> Result<Vec<C::Value>, DecodeError> {
        let strategy = EncodingStrategy::from_code(self.header.next_code()?)?;
        strategy.decode::<C>(self.buf, self.count)
    }

    pub fn unsigned_longs(&mut self) -> Result<Vec<i64>, DecodeError> {
        self.column::<UnsignedLongCodec>()
    }

    pub fn signed_longs(&mut self) -> Result<Vec<i64>, DecodeError> {
        self.column::<SignedLongCodec>()
    }

    pub fn strings(&mut self) -> Result<Vec<Option<String>>, DecodeError> {
        self.column::<StringCodec>()
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace value objects and their storage encoding.
//!
//! A span-family record is stored as two byte strings. The qualifier identifies the cell
//! (record type, owning application and agent, span id, first event sequence) and can be
//! filtered store-side without touching the payload. The column value carries everything else.
//!
//! Only `parent_application_name` and `parent_application_service_type` on [`Span`], and
//! `end_point`, `service_type` and `application_service_type` on [`SpanChunk`], are not
//! serialized. They are re-derived from context on the read path and are `None` after decode.

mod bitfield;
mod decoder;
mod encoder;

use std::fmt;
use std::str::FromStr;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::errors::{DecodeError, EncodeError};

pub use decoder::{SpanDecoder, SpanDecodingContext};
pub use encoder::SpanEncoder;

/// Qualifier type tag of a [`Span`] cell.
pub const TYPE_SPAN: u8 = 1;
/// Qualifier type tag of a [`SpanChunk`] cell.
pub const TYPE_SPAN_CHUNK: u8 = 2;
/// Format version written as the first byte of every column value.
pub const COLUMN_VERSION: u8 = 0;

const TRANSACTION_ID_DELIMITER: char = '^';

/// Correlates every span and chunk of one logical trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub sequence: i64,
}

impl TransactionId {
    pub fn new(agent_id: impl Into<String>, agent_start_time: i64, sequence: i64) -> Self {
        TransactionId {
            agent_id: agent_id.into(),
            agent_start_time,
            sequence,
        }
    }

    pub fn write_to(&self, buf: &mut WriteBuffer) -> Result<(), EncodeError> {
        buf.put_prefixed_string(Some(&self.agent_id))?;
        buf.put_vlong(self.agent_start_time as u64);
        buf.put_vlong(self.sequence as u64);
        Ok(())
    }

    pub fn read_from(buf: &mut ReadBuffer<'_>) -> Result<Self, DecodeError> {
        let agent_id = buf.read_required_string("transaction agent id")?;
        let agent_start_time = buf.read_vlong()? as i64;
        let sequence = buf.read_vlong()? as i64;
        Ok(TransactionId {
            agent_id,
            agent_start_time,
            sequence,
        })
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{TRANSACTION_ID_DELIMITER}{}{TRANSACTION_ID_DELIMITER}{}",
            self.agent_id, self.agent_start_time, self.sequence
        )
    }
}

impl FromStr for TransactionId {
    type Err = EncodeError;

    /// Parses `agent^start^sequence`. The numeric parts are taken from the right so that an
    /// agent id containing the delimiter still parses.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, TRANSACTION_ID_DELIMITER);
        let (Some(sequence), Some(start), Some(agent_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(EncodeError::InvalidValue(format!(
                "malformed transaction id {s:?}"
            )));
        };
        if agent_id.is_empty() {
            return Err(EncodeError::InvalidValue(format!(
                "transaction id {s:?} has an empty agent id"
            )));
        }
        let parse = |part: &str| {
            part.parse::<i64>().map_err(|e| {
                EncodeError::InvalidValue(format!("transaction id {s:?}: {part:?} {e}"))
            })
        };
        Ok(TransactionId {
            agent_id: agent_id.to_string(),
            agent_start_time: parse(start)?,
            sequence: parse(sequence)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub id: i32,
    pub message: Option<String>,
}

/// Typed annotation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Null,
    String(String),
    Bool(bool),
    Int(i32),
    Long(i64),
    /// Compared bit-exactly after decode, NaN payloads included.
    Double(f64),
    Bytes(Vec<u8>),
}

impl AnnotationValue {
    fn type_code(&self) -> u8 {
        match self {
            AnnotationValue::Null => 0,
            AnnotationValue::String(_) => 1,
            AnnotationValue::Bool(_) => 2,
            AnnotationValue::Int(_) => 3,
            AnnotationValue::Long(_) => 4,
            AnnotationValue::Double(_) => 5,
            AnnotationValue::Bytes(_) => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub key: i32,
    pub value: AnnotationValue,
}

impl Annotation {
    pub fn new(key: i32, value: AnnotationValue) -> Self {
        Annotation { key, value }
    }
}

pub(crate) fn write_annotations(
    annotations: &[Annotation],
    buf: &mut WriteBuffer,
) -> Result<(), EncodeError> {
    buf.put_vint(annotations.len() as u32);
    for annotation in annotations {
        buf.put_svint(annotation.key);
        buf.put_u8(annotation.value.type_code());
        match &annotation.value {
            AnnotationValue::Null => {}
            AnnotationValue::String(value) => buf.put_prefixed_string(Some(value))?,
            AnnotationValue::Bool(value) => buf.put_bool(*value),
            AnnotationValue::Int(value) => buf.put_svint(*value),
            AnnotationValue::Long(value) => buf.put_svlong(*value),
            AnnotationValue::Double(value) => buf.put_u64(value.to_bits()),
            AnnotationValue::Bytes(value) => buf.put_prefixed_bytes(Some(value))?,
        }
    }
    Ok(())
}

pub(crate) fn read_annotations(buf: &mut ReadBuffer<'_>) -> Result<Vec<Annotation>, DecodeError> {
    let count = buf.read_vint()? as usize;
    // Every annotation takes at least two bytes.
    if count > buf.remaining() / 2 {
        return Err(DecodeError::InvalidFormat(format!(
            "annotation count {count} exceeds payload"
        )));
    }
    let mut annotations = Vec::with_capacity(count);
    for _ in 0..count {
        let key = buf.read_svint()?;
        let value = match buf.read_u8()? {
            0 => AnnotationValue::Null,
            1 => AnnotationValue::String(buf.read_required_string("annotation value")?),
            2 => AnnotationValue::Bool(buf.read_bool()?),
            3 => AnnotationValue::Int(buf.read_svint()?),
            4 => AnnotationValue::Long(buf.read_svlong()?),
            5 => AnnotationValue::Double(f64::from_bits(buf.read_u64()?)),
            6 => AnnotationValue::Bytes(
                buf.read_prefixed_bytes()?
                    .ok_or_else(|| DecodeError::InvalidFormat("null annotation bytes".into()))?
                    .to_vec(),
            ),
            other => {
                return Err(DecodeError::InvalidType(format!(
                    "annotation type code {other}"
                )))
            }
        };
        annotations.push(Annotation { key, value });
    }
    Ok(annotations)
}

/// Identifies the asynchronous continuation a [`SpanChunk`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalAsyncId {
    pub async_id: i32,
    pub sequence: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanEvent {
    pub sequence: i16,
    pub depth: i32,
    /// Millis since the owning span started.
    pub start_elapsed: i32,
    /// Duration in millis.
    pub end_elapsed: i32,
    pub service_type: i16,
    pub api_id: i32,
    pub rpc: Option<String>,
    pub end_point: Option<String>,
    pub destination_id: Option<String>,
    pub next_span_id: Option<i64>,
    pub async_id: Option<i32>,
    pub exception_info: Option<ExceptionInfo>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    pub transaction_id: TransactionId,
    pub agent_id: String,
    pub application_name: String,
    pub agent_start_time: i64,
    pub span_id: i64,
    /// `0` for a root span.
    pub parent_span_id: i64,
    pub start_time: i64,
    pub elapsed: i32,
    pub rpc: Option<String>,
    pub service_type: i16,
    pub end_point: Option<String>,
    pub remote_addr: Option<String>,
    pub api_id: i32,
    pub err_code: Option<i32>,
    pub exception_info: Option<ExceptionInfo>,
    pub flag: i16,
    pub acceptor_host: Option<String>,
    pub logging_transaction_info: u8,
    pub collector_accept_time: i64,
    pub parent_application_name: Option<String>,
    pub parent_application_service_type: Option<i16>,
    pub annotations: Vec<Annotation>,
    pub span_events: Vec<SpanEvent>,
}

impl Span {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_span_id == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpanChunk {
    pub transaction_id: TransactionId,
    pub agent_id: String,
    pub application_name: String,
    pub agent_start_time: i64,
    pub span_id: i64,
    pub collector_accept_time: i64,
    pub local_async_id: Option<LocalAsyncId>,
    pub end_point: Option<String>,
    pub service_type: Option<i16>,
    pub application_service_type: Option<i16>,
    pub span_events: Vec<SpanEvent>,
}

/// A decoded span-family cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SpanRecord {
    Span(Span),
    SpanChunk(SpanChunk),
}

impl SpanRecord {
    #[must_use]
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            SpanRecord::Span(span) => &span.transaction_id,
            SpanRecord::SpanChunk(chunk) => &chunk.transaction_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_parse_and_format() {
        let id: TransactionId = "agent-1^1700000000000^42".parse().unwrap();
        assert_eq!(id, TransactionId::new("agent-1", 1_700_000_000_000, 42));
        assert_eq!(id.to_string(), "agent-1^1700000000000^42");
    }

    #[test]
    fn test_transaction_id_agent_with_delimiter() {
        let id: TransactionId = "a^b^10^7".parse().unwrap();
        assert_eq!(id.agent_id, "a^b");
        assert_eq!(id.agent_start_time, 10);
        assert_eq!(id.sequence, 7);
    }

    #[test]
    fn test_transaction_id_rejects_malformed() {
        assert!("agent-1^1700000000000".parse::<TransactionId>().is_err());
        assert!("agent-1^abc^42".parse::<TransactionId>().is_err());
        assert!("^1^2".parse::<TransactionId>().is_err());
    }

    #[test]
    fn test_transaction_id_binary_round_trip() {
        let id = TransactionId::new("agent-1", 1_700_000_000_000, 42);
        let mut buf = WriteBuffer::new();
        id.write_to(&mut buf).unwrap();
        let bytes = buf.freeze();
        let mut reader = ReadBuffer::new(&bytes);
        assert_eq!(TransactionId::read_from(&mut reader).unwrap(), id);
    }

    #[test]
    fn test_annotations_round_trip_bit_exact_double() {
        let annotations = vec![
            Annotation::new(-1, AnnotationValue::Null),
            Annotation::new(12, AnnotationValue::String("GET /users".into())),
            Annotation::new(13, AnnotationValue::Bool(true)),
            Annotation::new(14, AnnotationValue::Int(-5)),
            Annotation::new(15, AnnotationValue::Long(i64::MIN)),
            Annotation::new(16, AnnotationValue::Double(f64::from_bits(0x7ff8_0000_0000_0001))),
            Annotation::new(17, AnnotationValue::Bytes(vec![0, 1, 2])),
        ];
        let mut buf = WriteBuffer::new();
        write_annotations(&annotations, &mut buf).unwrap();
        let bytes = buf.freeze();
        let decoded = read_annotations(&mut ReadBuffer::new(&bytes)).unwrap();
        assert_eq!(decoded.len(), annotations.len());
        match &decoded[5].value {
            AnnotationValue::Double(value) => assert_eq!(value.to_bits(), 0x7ff8_0000_0000_0001),
            other => panic!("unexpected value {other:?}"),
        }
        assert_eq!(decoded[..5], annotations[..5]);
        assert_eq!(decoded[6], annotations[6]);
    }

    #[test]
    fn test_unknown_annotation_type() {
        let mut buf = WriteBuffer::new();
        buf.put_vint(1);
        buf.put_svint(1);
        buf.put_u8(42);
        let bytes = buf.freeze();
        assert!(matches!(
            read_annotations(&mut ReadBuffer::new(&bytes)),
            Err(DecodeError::InvalidType(_))
        ));
    }
}

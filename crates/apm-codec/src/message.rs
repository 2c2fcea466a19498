// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelopes wrapping encoded records for transmission from agent to collector.
//!
//! Storage encodings leave out values that the row key or the collector already knows. The
//! envelope carries exactly those values so the collector can rebuild a decoding context:
//!
//! ```text
//! span family  [version][transaction id][svlong base time][prefixed qualifier][column value]
//! agent stat   [version][stat type][prefixed agent id][svlong first timestamp][stat value]
//! api meta     [version][prefixed agent id][svlong agent start][svint api id][prefixed info][svint line][svint type]
//! sql meta     [version][prefixed agent id][svlong agent start][svint sql id][prefixed sql]
//! string meta  [version][prefixed agent id][svlong agent start][svint string id][prefixed value]
//! agent info   [version][prefixed agent id][svlong agent start][prefixed application][svint service type]
//!              [prefixed hostname][prefixed ip][svint pid][prefixed agent version]
//! ack          [version][vlong request id][bool success]
//! ```

use bytes::Bytes;
use derive_more::Display;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::errors::{DecodeError, EncodeError};
use crate::span::{Span, SpanChunk, SpanDecoder, SpanDecodingContext, SpanEncoder, SpanRecord, TransactionId};
use crate::stat::{AgentStatBatch, AgentStatDecodingContext, AgentStatType};

pub const ENVELOPE_VERSION: u8 = 1;

/// Tag written in front of every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum MessageKind {
    #[display("span")]
    Span = 1,
    #[display("span_chunk")]
    SpanChunk = 2,
    #[display("agent_stat_batch")]
    AgentStatBatch = 3,
    #[display("api_meta_data")]
    ApiMetaData = 10,
    #[display("sql_meta_data")]
    SqlMetaData = 11,
    #[display("string_meta_data")]
    StringMetaData = 12,
    #[display("agent_info")]
    AgentInfo = 13,
    #[display("ack")]
    Ack = 20,
}

impl MessageKind {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            1 => Ok(MessageKind::Span),
            2 => Ok(MessageKind::SpanChunk),
            3 => Ok(MessageKind::AgentStatBatch),
            10 => Ok(MessageKind::ApiMetaData),
            11 => Ok(MessageKind::SqlMetaData),
            12 => Ok(MessageKind::StringMetaData),
            13 => Ok(MessageKind::AgentInfo),
            20 => Ok(MessageKind::Ack),
            other => Err(DecodeError::InvalidType(format!("message kind {other}"))),
        }
    }

    /// Metadata kinds and agent registration are sent as acknowledged requests rather than
    /// streamed.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageKind::ApiMetaData
                | MessageKind::SqlMetaData
                | MessageKind::StringMetaData
                | MessageKind::AgentInfo
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiMetaData {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub api_id: i32,
    pub api_info: String,
    pub line: i32,
    pub api_type: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMetaData {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub sql_id: i32,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMetaData {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub string_id: i32,
    pub value: String,
}

/// Sent once per agent start so the collector can index the agent under its application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: String,
    pub agent_start_time: i64,
    pub application_name: String,
    pub service_type_code: i16,
    pub hostname: String,
    pub ip: String,
    pub pid: i32,
    pub agent_version: String,
}

/// Everything an agent hands to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Span(Span),
    SpanChunk(SpanChunk),
    AgentStatBatch(AgentStatBatch),
    ApiMetaData(ApiMetaData),
    SqlMetaData(SqlMetaData),
    StringMetaData(StringMetaData),
    AgentInfo(AgentInfo),
}

impl TelemetryMessage {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            TelemetryMessage::Span(_) => MessageKind::Span,
            TelemetryMessage::SpanChunk(_) => MessageKind::SpanChunk,
            TelemetryMessage::AgentStatBatch(_) => MessageKind::AgentStatBatch,
            TelemetryMessage::ApiMetaData(_) => MessageKind::ApiMetaData,
            TelemetryMessage::SqlMetaData(_) => MessageKind::SqlMetaData,
            TelemetryMessage::StringMetaData(_) => MessageKind::StringMetaData,
            TelemetryMessage::AgentInfo(_) => MessageKind::AgentInfo,
        }
    }

    /// Encodes the envelope payload. The kind tag is added by the transport frame.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = WriteBuffer::with_capacity(256);
        buf.put_u8(ENVELOPE_VERSION);
        match self {
            TelemetryMessage::Span(span) => {
                let encoder = SpanEncoder;
                let qualifier = encoder.encode_span_qualifier(span)?;
                let column_value = encoder.encode_span_column_value(span)?;
                write_span_envelope(
                    &mut buf,
                    &span.transaction_id,
                    span.collector_accept_time,
                    &qualifier,
                    &column_value,
                )?;
            }
            TelemetryMessage::SpanChunk(chunk) => {
                let encoder = SpanEncoder;
                let qualifier = encoder.encode_span_chunk_qualifier(chunk)?;
                let column_value = encoder.encode_span_chunk_column_value(chunk)?;
                write_span_envelope(
                    &mut buf,
                    &chunk.transaction_id,
                    chunk.collector_accept_time,
                    &qualifier,
                    &column_value,
                )?;
            }
            TelemetryMessage::AgentStatBatch(batch) => {
                let Some((agent_id, first_timestamp)) = batch.first() else {
                    return Err(EncodeError::EmptyBatch("stat data points"));
                };
                buf.put_u8(batch.stat_type().code());
                buf.put_prefixed_string(Some(agent_id))?;
                buf.put_svlong(first_timestamp);
                batch.encode_values(&mut buf)?;
            }
            TelemetryMessage::ApiMetaData(meta) => {
                write_meta_header(&mut buf, &meta.agent_id, meta.agent_start_time)?;
                buf.put_svint(meta.api_id);
                buf.put_prefixed_string(Some(&meta.api_info))?;
                buf.put_svint(meta.line);
                buf.put_svint(meta.api_type);
            }
            TelemetryMessage::SqlMetaData(meta) => {
                write_meta_header(&mut buf, &meta.agent_id, meta.agent_start_time)?;
                buf.put_svint(meta.sql_id);
                buf.put_prefixed_string(Some(&meta.sql))?;
            }
            TelemetryMessage::StringMetaData(meta) => {
                write_meta_header(&mut buf, &meta.agent_id, meta.agent_start_time)?;
                buf.put_svint(meta.string_id);
                buf.put_prefixed_string(Some(&meta.value))?;
            }
            TelemetryMessage::AgentInfo(info) => {
                write_meta_header(&mut buf, &info.agent_id, info.agent_start_time)?;
                if info.application_name.is_empty() {
                    return Err(EncodeError::InvalidValue(
                        "application name is required".into(),
                    ));
                }
                buf.put_prefixed_string(Some(&info.application_name))?;
                buf.put_svint(i32::from(info.service_type_code));
                buf.put_prefixed_string(Some(&info.hostname))?;
                buf.put_prefixed_string(Some(&info.ip))?;
                buf.put_svint(info.pid);
                buf.put_prefixed_string(Some(&info.agent_version))?;
            }
        }
        Ok(buf.freeze())
    }
}

fn write_span_envelope(
    buf: &mut WriteBuffer,
    transaction_id: &TransactionId,
    base_time: i64,
    qualifier: &[u8],
    column_value: &[u8],
) -> Result<(), EncodeError> {
    transaction_id.write_to(buf)?;
    buf.put_svlong(base_time);
    buf.put_prefixed_bytes(Some(qualifier))?;
    buf.put_bytes(column_value);
    Ok(())
}

fn write_meta_header(
    buf: &mut WriteBuffer,
    agent_id: &str,
    agent_start_time: i64,
) -> Result<(), EncodeError> {
    if agent_id.is_empty() {
        return Err(EncodeError::InvalidValue("agent id is required".into()));
    }
    buf.put_prefixed_string(Some(agent_id))?;
    buf.put_svlong(agent_start_time);
    Ok(())
}

fn read_version(buf: &mut ReadBuffer<'_>) -> Result<(), DecodeError> {
    match buf.read_u8()? {
        ENVELOPE_VERSION => Ok(()),
        other => Err(DecodeError::UnknownVersion(other)),
    }
}

/// A span-family envelope with its storage cell still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanEnvelope {
    pub transaction_id: TransactionId,
    pub base_time: i64,
    pub qualifier: Bytes,
    pub column_value: Bytes,
}

impl SpanEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        read_version(&mut buf)?;
        let transaction_id = TransactionId::read_from(&mut buf)?;
        let base_time = buf.read_svlong()?;
        let qualifier = buf
            .read_prefixed_bytes()?
            .ok_or_else(|| DecodeError::InvalidFormat("missing span qualifier".into()))?;
        let column_value = buf.read_remaining();
        Ok(SpanEnvelope {
            transaction_id,
            base_time,
            qualifier: Bytes::copy_from_slice(qualifier),
            column_value: Bytes::copy_from_slice(column_value),
        })
    }

    #[must_use]
    pub fn context(&self) -> SpanDecodingContext {
        SpanDecodingContext {
            transaction_id: self.transaction_id.clone(),
            collector_accept_time: self.base_time,
        }
    }

    pub fn decode_record(&self) -> Result<SpanRecord, DecodeError> {
        SpanDecoder.decode(&self.qualifier, &self.column_value, &self.context())
    }
}

/// An agent stat envelope with its batch still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEnvelope {
    pub stat_type: AgentStatType,
    pub agent_id: String,
    pub first_timestamp: i64,
    pub value: Bytes,
}

impl StatEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        read_version(&mut buf)?;
        let stat_type = AgentStatType::from_code(buf.read_u8()?)?;
        let agent_id = buf.read_required_string("stat agent id")?;
        let first_timestamp = buf.read_svlong()?;
        Ok(StatEnvelope {
            stat_type,
            agent_id,
            first_timestamp,
            value: Bytes::copy_from_slice(buf.read_remaining()),
        })
    }

    /// Decodes the batch against a context aligned to `timespan` millis.
    pub fn decode_batch(
        &self,
        timespan: i64,
    ) -> Result<(AgentStatDecodingContext, AgentStatBatch), DecodeError> {
        let ctx = AgentStatDecodingContext::aligned(self.agent_id.clone(), self.first_timestamp, timespan)
            .map_err(|e| DecodeError::InvalidFormat(e.to_string()))?;
        let mut buf = ReadBuffer::new(&self.value);
        let batch = AgentStatBatch::decode_values(self.stat_type, &mut buf, &ctx)?;
        buf.expect_end()?;
        Ok((ctx, batch))
    }
}

fn read_meta_header(buf: &mut ReadBuffer<'_>) -> Result<(String, i64), DecodeError> {
    read_version(buf)?;
    let agent_id = buf.read_required_string("metadata agent id")?;
    let agent_start_time = buf.read_svlong()?;
    Ok((agent_id, agent_start_time))
}

impl ApiMetaData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        let (agent_id, agent_start_time) = read_meta_header(&mut buf)?;
        let meta = ApiMetaData {
            agent_id,
            agent_start_time,
            api_id: buf.read_svint()?,
            api_info: buf.read_required_string("api info")?,
            line: buf.read_svint()?,
            api_type: buf.read_svint()?,
        };
        buf.expect_end()?;
        Ok(meta)
    }
}

impl SqlMetaData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        let (agent_id, agent_start_time) = read_meta_header(&mut buf)?;
        let meta = SqlMetaData {
            agent_id,
            agent_start_time,
            sql_id: buf.read_svint()?,
            sql: buf.read_required_string("sql")?,
        };
        buf.expect_end()?;
        Ok(meta)
    }
}

impl StringMetaData {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        let (agent_id, agent_start_time) = read_meta_header(&mut buf)?;
        let meta = StringMetaData {
            agent_id,
            agent_start_time,
            string_id: buf.read_svint()?,
            value: buf.read_required_string("string value")?,
        };
        buf.expect_end()?;
        Ok(meta)
    }
}

impl AgentInfo {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        let (agent_id, agent_start_time) = read_meta_header(&mut buf)?;
        let application_name = buf.read_required_string("application name")?;
        let service_type_code = buf.read_svint()?;
        let service_type_code = i16::try_from(service_type_code).map_err(|_| {
            DecodeError::InvalidFormat(format!("service type {service_type_code} out of range"))
        })?;
        let info = AgentInfo {
            agent_id,
            agent_start_time,
            application_name,
            service_type_code,
            hostname: buf.read_required_string("hostname")?,
            ip: buf.read_required_string("ip")?,
            pid: buf.read_svint()?,
            agent_version: buf.read_required_string("agent version")?,
        };
        buf.expect_end()?;
        Ok(info)
    }
}

/// Collector answer to a metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub request_id: u64,
    pub success: bool,
}

impl Ack {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(12);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_vlong(self.request_id);
        buf.put_bool(self.success);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(payload);
        read_version(&mut buf)?;
        let ack = Ack {
            request_id: buf.read_vlong()?,
            success: buf.read_bool()?,
        };
        buf.expect_end()?;
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::{StatPoint, TotalThreadCount};

    #[test]
    fn test_kind_codes() {
        for kind in [
            MessageKind::Span,
            MessageKind::SpanChunk,
            MessageKind::AgentStatBatch,
            MessageKind::ApiMetaData,
            MessageKind::SqlMetaData,
            MessageKind::StringMetaData,
            MessageKind::AgentInfo,
            MessageKind::Ack,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!(MessageKind::from_code(99).is_err());
        assert!(MessageKind::SqlMetaData.is_request());
        assert!(!MessageKind::Span.is_request());
    }

    #[test]
    fn test_stat_envelope_round_trip() {
        let points = vec![
            StatPoint::new("agent-1", 10, 1_700_000_065_000, TotalThreadCount { total_thread_count: 40 }),
            StatPoint::new("agent-1", 10, 1_700_000_070_000, TotalThreadCount { total_thread_count: 41 }),
        ];
        let message = TelemetryMessage::AgentStatBatch(AgentStatBatch::TotalThreadCount(points.clone()));
        let payload = message.encode().unwrap();

        let envelope = StatEnvelope::decode(&payload).unwrap();
        assert_eq!(envelope.stat_type, AgentStatType::TotalThreadCount);
        assert_eq!(envelope.agent_id, "agent-1");
        let (ctx, batch) = envelope.decode_batch(60_000).unwrap();
        assert_eq!(ctx.base_timestamp, 1_700_000_040_000);
        assert_eq!(batch, AgentStatBatch::TotalThreadCount(points));
    }

    #[test]
    fn test_empty_stat_batch_is_rejected() {
        let message = TelemetryMessage::AgentStatBatch(AgentStatBatch::CpuLoad(vec![]));
        assert_eq!(message.encode(), Err(EncodeError::EmptyBatch("stat data points")));
    }

    #[test]
    fn test_metadata_round_trip() {
        let api = ApiMetaData {
            agent_id: "agent-1".into(),
            agent_start_time: 1_700_000_000_000,
            api_id: 12,
            api_info: "com.example.OrderService.place(Order)".into(),
            line: 88,
            api_type: 0,
        };
        let payload = TelemetryMessage::ApiMetaData(api.clone()).encode().unwrap();
        assert_eq!(ApiMetaData::decode(&payload).unwrap(), api);

        let sql = SqlMetaData {
            agent_id: "agent-1".into(),
            agent_start_time: 1_700_000_000_000,
            sql_id: 3,
            sql: "SELECT * FROM orders WHERE id = ?".into(),
        };
        let payload = TelemetryMessage::SqlMetaData(sql.clone()).encode().unwrap();
        assert_eq!(SqlMetaData::decode(&payload).unwrap(), sql);
    }

    #[test]
    fn test_agent_info_round_trip() {
        let info = AgentInfo {
            agent_id: "agent-1".into(),
            agent_start_time: 1_700_000_000_000,
            application_name: "checkout".into(),
            service_type_code: 1010,
            hostname: "web-01".into(),
            ip: "10.0.0.7".into(),
            pid: 4242,
            agent_version: "2.5.1".into(),
        };
        let message = TelemetryMessage::AgentInfo(info.clone());
        assert!(message.kind().is_request());
        let payload = message.encode().unwrap();
        assert_eq!(AgentInfo::decode(&payload).unwrap(), info);

        let nameless = TelemetryMessage::AgentInfo(AgentInfo {
            application_name: String::new(),
            ..info
        });
        assert!(matches!(nameless.encode(), Err(EncodeError::InvalidValue(_))));
    }

    #[test]
    fn test_ack_round_trip_and_version_check() {
        let ack = Ack {
            request_id: 7,
            success: false,
        };
        let bytes = ack.encode();
        assert_eq!(Ack::decode(&bytes).unwrap(), ack);

        let mut corrupt = bytes.to_vec();
        corrupt[0] = 0;
        assert_eq!(Ack::decode(&corrupt), Err(DecodeError::UnknownVersion(0)));
    }
}

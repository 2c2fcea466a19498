// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::ReadBuffer;
use crate::errors::DecodeError;

use super::bitfield::{event_bits, span_bits, Bitfield};
use super::{
    read_annotations, ExceptionInfo, LocalAsyncId, Span, SpanChunk, SpanEvent, SpanRecord,
    TransactionId, COLUMN_VERSION, TYPE_SPAN, TYPE_SPAN_CHUNK,
};

/// Out-of-band values needed to rebuild a span-family record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanDecodingContext {
    pub transaction_id: TransactionId,
    /// Base the span start time was encoded against.
    pub collector_accept_time: i64,
}

#[derive(Debug)]
struct Qualifier {
    record_type: u8,
    application_name: String,
    agent_id: String,
    agent_start_time: i64,
    span_id: i64,
    first_event_sequence: i32,
    local_async_id: Option<LocalAsyncId>,
}

impl Qualifier {
    fn read(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = ReadBuffer::new(data);
        let record_type = buf.read_u8()?;
        if record_type != TYPE_SPAN && record_type != TYPE_SPAN_CHUNK {
            return Err(DecodeError::InvalidType(format!(
                "span qualifier type {record_type}"
            )));
        }
        let application_name = buf.read_required_string("application name")?;
        let agent_id = buf.read_required_string("agent id")?;
        let agent_start_time = buf.read_vlong()? as i64;
        let span_id = buf.read_i64()?;
        let first_event_sequence = buf.read_svint()?;
        let local_async_id = if buf.read_bool()? {
            Some(LocalAsyncId {
                async_id: buf.read_i32()?,
                sequence: buf.read_vint()? as i32,
            })
        } else {
            None
        };
        buf.expect_end()?;
        Ok(Qualifier {
            record_type,
            application_name,
            agent_id,
            agent_start_time,
            span_id,
            first_event_sequence,
            local_async_id,
        })
    }
}

/// Rebuilds span-family records from a qualifier and column value pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanDecoder;

impl SpanDecoder {
    pub fn decode(
        &self,
        qualifier: &[u8],
        column_value: &[u8],
        ctx: &SpanDecodingContext,
    ) -> Result<SpanRecord, DecodeError> {
        let qualifier = Qualifier::read(qualifier)?;

        let mut buf = ReadBuffer::new(column_value);
        let version = buf.read_u8()?;
        if version != COLUMN_VERSION {
            return Err(DecodeError::UnknownVersion(version));
        }

        let record = match qualifier.record_type {
            TYPE_SPAN => SpanRecord::Span(decode_span(&qualifier, &mut buf, ctx)?),
            _ => SpanRecord::SpanChunk(decode_span_chunk(&qualifier, &mut buf, ctx)?),
        };
        buf.expect_end()?;
        Ok(record)
    }
}

fn decode_span(
    qualifier: &Qualifier,
    buf: &mut ReadBuffer<'_>,
    ctx: &SpanDecodingContext,
) -> Result<Span, DecodeError> {
    if qualifier.local_async_id.is_some() {
        return Err(DecodeError::InvalidFormat(
            "span qualifier carries a local async id".into(),
        ));
    }
    let bitfield = Bitfield::from_bits(buf.read_u16()?, span_bits::MASK, "span")?;

    let parent_span_id = if bitfield.is_set(span_bits::ROOT) {
        0
    } else {
        buf.read_i64()?
    };
    let start_time = ctx.collector_accept_time.wrapping_sub(buf.read_svlong()?);
    let elapsed = buf.read_svint()?;
    let rpc = buf.read_prefixed_string()?;
    let service_type = read_i16(buf, "service type")?;
    let end_point = buf.read_prefixed_string()?;
    let remote_addr = buf.read_prefixed_string()?;
    let api_id = buf.read_svint()?;

    let err_code = if bitfield.is_set(span_bits::ERR_CODE) {
        Some(buf.read_svint()?)
    } else {
        None
    };
    let exception_info = if bitfield.is_set(span_bits::EXCEPTION) {
        Some(read_exception(buf)?)
    } else {
        None
    };
    let flag = if bitfield.is_set(span_bits::FLAG) {
        buf.read_i16()?
    } else {
        0
    };
    let logging_transaction_info = if bitfield.is_set(span_bits::LOGGING_INFO) {
        buf.read_u8()?
    } else {
        0
    };
    let acceptor_host = buf.read_prefixed_string()?;
    let annotations = if bitfield.is_set(span_bits::ANNOTATIONS) {
        read_annotations(buf)?
    } else {
        Vec::new()
    };
    let span_events = read_span_events(buf)?;
    check_first_sequence(qualifier, &span_events)?;

    Ok(Span {
        transaction_id: ctx.transaction_id.clone(),
        agent_id: qualifier.agent_id.clone(),
        application_name: qualifier.application_name.clone(),
        agent_start_time: qualifier.agent_start_time,
        span_id: qualifier.span_id,
        parent_span_id,
        start_time,
        elapsed,
        rpc,
        service_type,
        end_point,
        remote_addr,
        api_id,
        err_code,
        exception_info,
        flag,
        acceptor_host,
        logging_transaction_info,
        collector_accept_time: ctx.collector_accept_time,
        parent_application_name: None,
        parent_application_service_type: None,
        annotations,
        span_events,
    })
}

fn decode_span_chunk(
    qualifier: &Qualifier,
    buf: &mut ReadBuffer<'_>,
    ctx: &SpanDecodingContext,
) -> Result<SpanChunk, DecodeError> {
    let span_events = read_span_events(buf)?;
    check_first_sequence(qualifier, &span_events)?;
    Ok(SpanChunk {
        transaction_id: ctx.transaction_id.clone(),
        agent_id: qualifier.agent_id.clone(),
        application_name: qualifier.application_name.clone(),
        agent_start_time: qualifier.agent_start_time,
        span_id: qualifier.span_id,
        collector_accept_time: ctx.collector_accept_time,
        local_async_id: qualifier.local_async_id,
        end_point: None,
        service_type: None,
        application_service_type: None,
        span_events,
    })
}

fn check_first_sequence(qualifier: &Qualifier, events: &[SpanEvent]) -> Result<(), DecodeError> {
    let first = events.first().map_or(-1, |event| i32::from(event.sequence));
    if first != qualifier.first_event_sequence {
        return Err(DecodeError::InvalidFormat(format!(
            "qualifier first event sequence {} does not match column value {first}",
            qualifier.first_event_sequence
        )));
    }
    Ok(())
}

fn read_i16(buf: &mut ReadBuffer<'_>, field: &str) -> Result<i16, DecodeError> {
    let value = buf.read_svint()?;
    i16::try_from(value)
        .map_err(|_| DecodeError::InvalidFormat(format!("{field} {value} out of range")))
}

fn read_exception(buf: &mut ReadBuffer<'_>) -> Result<ExceptionInfo, DecodeError> {
    Ok(ExceptionInfo {
        id: buf.read_svint()?,
        message: buf.read_prefixed_string()?,
    })
}

fn read_span_events(buf: &mut ReadBuffer<'_>) -> Result<Vec<SpanEvent>, DecodeError> {
    let count = buf.read_vint()? as usize;
    // Each event needs at least its bitfield and end elapsed/api id.
    if count > buf.remaining() / 4 {
        return Err(DecodeError::InvalidFormat(format!(
            "span event count {count} exceeds payload"
        )));
    }
    let mut events: Vec<SpanEvent> = Vec::with_capacity(count);
    for _ in 0..count {
        let bitfield = Bitfield::from_bits(buf.read_u16()?, event_bits::MASK, "span event")?;
        let prev = events.last();
        if prev.is_none() && bitfield.bits() & event_bits::PREV_MASK != 0 {
            return Err(DecodeError::InvalidFormat(
                "first span event refers to a previous event".into(),
            ));
        }

        let sequence = match prev {
            Some(prev) if bitfield.is_set(event_bits::SEQUENCE_NEXT) => prev.sequence.wrapping_add(1),
            _ => read_i16(buf, "span event sequence")?,
        };
        let start_elapsed = match prev {
            None => buf.read_svint()?,
            Some(prev) if bitfield.is_set(event_bits::START_ELAPSED_EQUALS_PREV) => {
                prev.start_elapsed
            }
            Some(prev) => prev.start_elapsed.wrapping_add(buf.read_svint()?),
        };
        let depth = match prev {
            Some(prev) if bitfield.is_set(event_bits::DEPTH_EQUALS_PREV) => prev.depth,
            _ => buf.read_svint()?,
        };
        let service_type = match prev {
            Some(prev) if bitfield.is_set(event_bits::SERVICE_TYPE_EQUALS_PREV) => {
                prev.service_type
            }
            _ => read_i16(buf, "span event service type")?,
        };
        let end_elapsed = buf.read_svint()?;
        let api_id = buf.read_svint()?;

        let mut event = SpanEvent {
            sequence,
            depth,
            start_elapsed,
            end_elapsed,
            service_type,
            api_id,
            ..Default::default()
        };
        if bitfield.is_set(event_bits::RPC) {
            event.rpc = Some(buf.read_required_string("span event rpc")?);
        }
        if bitfield.is_set(event_bits::END_POINT) {
            event.end_point = Some(buf.read_required_string("span event end point")?);
        }
        if bitfield.is_set(event_bits::DESTINATION_ID) {
            event.destination_id = Some(buf.read_required_string("span event destination id")?);
        }
        if bitfield.is_set(event_bits::NEXT_SPAN_ID) {
            event.next_span_id = Some(buf.read_i64()?);
        }
        if bitfield.is_set(event_bits::ASYNC_ID) {
            event.async_id = Some(buf.read_svint()?);
        }
        if bitfield.is_set(event_bits::EXCEPTION) {
            event.exception_info = Some(read_exception(buf)?);
        }
        if bitfield.is_set(event_bits::ANNOTATIONS) {
            event.annotations = read_annotations(buf)?;
        }
        events.push(event);
    }
    Ok(events)
}

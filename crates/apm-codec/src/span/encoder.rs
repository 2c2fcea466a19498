// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use tracing::debug;

use crate::buffer::WriteBuffer;
use crate::errors::EncodeError;

use super::bitfield::{event_bitfield, event_bits, span_bitfield, span_bits};
use super::{
    write_annotations, LocalAsyncId, Span, SpanChunk, SpanEvent, COLUMN_VERSION, TYPE_SPAN,
    TYPE_SPAN_CHUNK,
};

/// Stateless encoder producing the qualifier and column value of span-family cells.
///
/// Span start times are written relative to `collector_accept_time`, which the decoder gets back
/// from its [`super::SpanDecodingContext`] rather than from the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpanEncoder;

impl SpanEncoder {
    pub fn encode_span_qualifier(&self, span: &Span) -> Result<Bytes, EncodeError> {
        check_identity(&span.agent_id, &span.application_name)?;
        encode_qualifier(
            TYPE_SPAN,
            &span.application_name,
            &span.agent_id,
            span.agent_start_time,
            span.span_id,
            span.span_events.first(),
            None,
        )
    }

    pub fn encode_span_column_value(&self, span: &Span) -> Result<Bytes, EncodeError> {
        let mut buf = WriteBuffer::with_capacity(256);
        buf.put_u8(COLUMN_VERSION);

        let bitfield = span_bitfield(span);
        buf.put_u16(bitfield.bits());
        if !bitfield.is_set(span_bits::ROOT) {
            buf.put_i64(span.parent_span_id);
        }
        buf.put_svlong(span.collector_accept_time.wrapping_sub(span.start_time));
        buf.put_svint(span.elapsed);
        buf.put_prefixed_string(span.rpc.as_deref())?;
        buf.put_svint(i32::from(span.service_type));
        buf.put_prefixed_string(span.end_point.as_deref())?;
        buf.put_prefixed_string(span.remote_addr.as_deref())?;
        buf.put_svint(span.api_id);

        if let Some(err_code) = span.err_code {
            buf.put_svint(err_code);
        }
        if let Some(exception) = &span.exception_info {
            buf.put_svint(exception.id);
            buf.put_prefixed_string(exception.message.as_deref())?;
        }
        if bitfield.is_set(span_bits::FLAG) {
            buf.put_i16(span.flag);
        }
        if bitfield.is_set(span_bits::LOGGING_INFO) {
            buf.put_u8(span.logging_transaction_info);
        }
        buf.put_prefixed_string(span.acceptor_host.as_deref())?;
        if bitfield.is_set(span_bits::ANNOTATIONS) {
            write_annotations(&span.annotations, &mut buf)?;
        }
        write_span_events(&span.span_events, &mut buf)?;

        debug!(
            "Encoded span {} of {} into {} bytes",
            span.span_id,
            span.transaction_id,
            buf.len()
        );
        Ok(buf.freeze())
    }

    pub fn encode_span_chunk_qualifier(&self, chunk: &SpanChunk) -> Result<Bytes, EncodeError> {
        check_identity(&chunk.agent_id, &chunk.application_name)?;
        encode_qualifier(
            TYPE_SPAN_CHUNK,
            &chunk.application_name,
            &chunk.agent_id,
            chunk.agent_start_time,
            chunk.span_id,
            chunk.span_events.first(),
            chunk.local_async_id,
        )
    }

    pub fn encode_span_chunk_column_value(&self, chunk: &SpanChunk) -> Result<Bytes, EncodeError> {
        if chunk.span_events.is_empty() {
            return Err(EncodeError::EmptyBatch("span chunk events"));
        }
        let mut buf = WriteBuffer::with_capacity(128);
        buf.put_u8(COLUMN_VERSION);
        write_span_events(&chunk.span_events, &mut buf)?;
        Ok(buf.freeze())
    }
}

fn check_identity(agent_id: &str, application_name: &str) -> Result<(), EncodeError> {
    if agent_id.is_empty() {
        return Err(EncodeError::InvalidValue("agent id is required".into()));
    }
    if application_name.is_empty() {
        return Err(EncodeError::InvalidValue(
            "application name is required".into(),
        ));
    }
    Ok(())
}

fn encode_qualifier(
    record_type: u8,
    application_name: &str,
    agent_id: &str,
    agent_start_time: i64,
    span_id: i64,
    first_event: Option<&SpanEvent>,
    local_async_id: Option<LocalAsyncId>,
) -> Result<Bytes, EncodeError> {
    let mut buf = WriteBuffer::with_capacity(64);
    buf.put_u8(record_type);
    buf.put_prefixed_string(Some(application_name))?;
    buf.put_prefixed_string(Some(agent_id))?;
    buf.put_vlong(agent_start_time as u64);
    buf.put_i64(span_id);
    buf.put_svint(first_event.map_or(-1, |event| i32::from(event.sequence)));
    match local_async_id {
        Some(local_async_id) => {
            buf.put_bool(true);
            buf.put_i32(local_async_id.async_id);
            buf.put_vint(local_async_id.sequence as u32);
        }
        None => buf.put_bool(false),
    }
    Ok(buf.freeze())
}

fn write_span_events(events: &[SpanEvent], buf: &mut WriteBuffer) -> Result<(), EncodeError> {
    buf.put_vint(events.len() as u32);
    let mut prev: Option<&SpanEvent> = None;
    for event in events {
        let bitfield = event_bitfield(event, prev);
        buf.put_u16(bitfield.bits());

        if !bitfield.is_set(event_bits::SEQUENCE_NEXT) {
            buf.put_svint(i32::from(event.sequence));
        }
        match prev {
            None => buf.put_svint(event.start_elapsed),
            Some(prev) if !bitfield.is_set(event_bits::START_ELAPSED_EQUALS_PREV) => {
                buf.put_svint(event.start_elapsed.wrapping_sub(prev.start_elapsed));
            }
            Some(_) => {}
        }
        if !bitfield.is_set(event_bits::DEPTH_EQUALS_PREV) {
            buf.put_svint(event.depth);
        }
        if !bitfield.is_set(event_bits::SERVICE_TYPE_EQUALS_PREV) {
            buf.put_svint(i32::from(event.service_type));
        }
        buf.put_svint(event.end_elapsed);
        buf.put_svint(event.api_id);

        if let Some(rpc) = &event.rpc {
            buf.put_prefixed_string(Some(rpc))?;
        }
        if let Some(end_point) = &event.end_point {
            buf.put_prefixed_string(Some(end_point))?;
        }
        if let Some(destination_id) = &event.destination_id {
            buf.put_prefixed_string(Some(destination_id))?;
        }
        if let Some(next_span_id) = event.next_span_id {
            buf.put_i64(next_span_id);
        }
        if let Some(async_id) = event.async_id {
            buf.put_svint(async_id);
        }
        if let Some(exception) = &event.exception_info {
            buf.put_svint(exception.id);
            buf.put_prefixed_string(exception.message.as_deref())?;
        }
        if !event.annotations.is_empty() {
            write_annotations(&event.annotations, buf)?;
        }
        prev = Some(event);
    }
    Ok(())
}

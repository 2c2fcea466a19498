// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frames and the routing of message kinds onto channels.
//!
//! ```text
//! stream frame   [kind:1B][envelope]
//! request frame  [kind:1B][vlong request id][envelope]
//! ack frame      [kind:1B = ack][ack envelope]
//! ```

use apm_codec::message::{Ack, MessageKind};
use apm_codec::{DecodeError, ReadBuffer, WriteBuffer};
use bytes::Bytes;
use derive_more::Display;

use crate::errors::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ChannelKind {
    #[display("span")]
    Span,
    #[display("stat")]
    Stat,
    #[display("metadata")]
    Metadata,
}

/// How a message kind leaves the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundCall {
    /// Fire-and-forget on a streaming channel.
    Stream(ChannelKind),
    /// Unary request answered by an [`Ack`].
    Request,
    /// Only ever sent by the collector.
    Inbound,
}

/// Routing table for outbound messages. Every kind is listed so a new kind fails to compile
/// until it is routed.
#[must_use]
pub fn outbound_call(kind: MessageKind) -> OutboundCall {
    match kind {
        MessageKind::Span | MessageKind::SpanChunk => OutboundCall::Stream(ChannelKind::Span),
        MessageKind::AgentStatBatch => OutboundCall::Stream(ChannelKind::Stat),
        MessageKind::ApiMetaData
        | MessageKind::SqlMetaData
        | MessageKind::StringMetaData
        | MessageKind::AgentInfo => OutboundCall::Request,
        MessageKind::Ack => OutboundCall::Inbound,
    }
}

#[must_use]
pub fn channel(kind: MessageKind) -> Option<ChannelKind> {
    match outbound_call(kind) {
        OutboundCall::Stream(channel) => Some(channel),
        OutboundCall::Request => Some(ChannelKind::Metadata),
        OutboundCall::Inbound => None,
    }
}

/// An encoded envelope tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: Bytes) -> Self {
        Frame { kind, payload }
    }

    pub fn ack(ack: &Ack) -> Self {
        Frame::new(MessageKind::Ack, ack.encode())
    }

    /// Size on the wire, without the length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }
}

pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut buf = WriteBuffer::with_capacity(frame.encoded_len());
    buf.put_u8(frame.kind.code());
    buf.put_bytes(&frame.payload);
    buf.freeze()
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let mut buf = ReadBuffer::new(bytes);
    let kind = MessageKind::from_code(buf.read_u8()?)?;
    Ok(Frame::new(kind, Bytes::copy_from_slice(buf.read_remaining())))
}

pub fn encode_request(request_id: u64, frame: &Frame) -> Bytes {
    let mut buf = WriteBuffer::with_capacity(frame.encoded_len() + 10);
    buf.put_u8(frame.kind.code());
    buf.put_vlong(request_id);
    buf.put_bytes(&frame.payload);
    buf.freeze()
}

/// Splits a request frame into its id and the frame it carries.
pub fn decode_request(bytes: &[u8]) -> Result<(u64, Frame), DecodeError> {
    let mut buf = ReadBuffer::new(bytes);
    let kind = MessageKind::from_code(buf.read_u8()?)?;
    if !kind.is_request() {
        return Err(DecodeError::InvalidType(format!("{kind} is not a request")));
    }
    let request_id = buf.read_vlong()?;
    Ok((
        request_id,
        Frame::new(kind, Bytes::copy_from_slice(buf.read_remaining())),
    ))
}

/// Reads the collector answer to request `request_id`.
pub fn decode_ack(bytes: &[u8], request_id: u64) -> Result<Ack, TransportError> {
    let frame = decode_frame(bytes)?;
    if frame.kind != MessageKind::Ack {
        return Err(TransportError::UnexpectedFrame(format!(
            "expected ack, got {}",
            frame.kind
        )));
    }
    let ack = Ack::decode(&frame.payload)?;
    if ack.request_id != request_id {
        return Err(TransportError::UnexpectedFrame(format!(
            "ack for request {} while waiting for {}",
            ack.request_id, request_id
        )));
    }
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_table() {
        assert_eq!(channel(MessageKind::Span), Some(ChannelKind::Span));
        assert_eq!(channel(MessageKind::SpanChunk), Some(ChannelKind::Span));
        assert_eq!(channel(MessageKind::AgentStatBatch), Some(ChannelKind::Stat));
        assert_eq!(channel(MessageKind::SqlMetaData), Some(ChannelKind::Metadata));
        assert_eq!(channel(MessageKind::Ack), None);
        assert_eq!(outbound_call(MessageKind::ApiMetaData), OutboundCall::Request);
        assert_eq!(channel(MessageKind::AgentInfo), Some(ChannelKind::Metadata));
    }

    #[test]
    fn test_request_frame_round_trip() {
        let frame = Frame::new(MessageKind::StringMetaData, Bytes::from_static(b"\x01abc"));
        let bytes = encode_request(300, &frame);
        assert_eq!(decode_request(&bytes).unwrap(), (300, frame.clone()));

        // A stream frame is not a request.
        let span = Frame::new(MessageKind::Span, Bytes::from_static(b"\x01"));
        assert!(decode_request(&encode_frame(&span)).is_err());
    }

    #[test]
    fn test_ack_must_match_request() {
        let ack = Ack {
            request_id: 5,
            success: true,
        };
        let bytes = encode_frame(&Frame::ack(&ack));
        assert_eq!(decode_ack(&bytes, 5).unwrap(), ack);
        assert!(matches!(
            decode_ack(&bytes, 6),
            Err(TransportError::UnexpectedFrame(_))
        ));
    }
}

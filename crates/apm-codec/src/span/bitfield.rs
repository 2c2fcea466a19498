// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::DecodeError;

use super::{Span, SpanEvent};

/// Presence flags written in front of a span or span event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bitfield(u16);

impl Bitfield {
    pub(crate) fn set(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= 1 << bit;
        }
    }

    pub(crate) fn is_set(self, bit: u16) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub(crate) fn bits(self) -> u16 {
        self.0
    }

    /// Accepts a raw value only when no bit outside `known_mask` is set.
    pub(crate) fn from_bits(bits: u16, known_mask: u16, what: &str) -> Result<Self, DecodeError> {
        if bits & !known_mask != 0 {
            return Err(DecodeError::InvalidFormat(format!(
                "unknown {what} flags {:#06x}",
                bits & !known_mask
            )));
        }
        Ok(Bitfield(bits))
    }
}

pub(crate) mod span_bits {
    pub const ROOT: u16 = 0;
    pub const ERR_CODE: u16 = 1;
    pub const EXCEPTION: u16 = 2;
    pub const FLAG: u16 = 3;
    pub const LOGGING_INFO: u16 = 4;
    pub const ANNOTATIONS: u16 = 5;

    pub const MASK: u16 = (1 << 6) - 1;
}

pub(crate) mod event_bits {
    pub const RPC: u16 = 0;
    pub const END_POINT: u16 = 1;
    pub const DESTINATION_ID: u16 = 2;
    pub const NEXT_SPAN_ID: u16 = 3;
    pub const ASYNC_ID: u16 = 4;
    pub const EXCEPTION: u16 = 5;
    pub const ANNOTATIONS: u16 = 6;
    pub const START_ELAPSED_EQUALS_PREV: u16 = 7;
    pub const DEPTH_EQUALS_PREV: u16 = 8;
    pub const SERVICE_TYPE_EQUALS_PREV: u16 = 9;
    pub const SEQUENCE_NEXT: u16 = 10;

    pub const MASK: u16 = (1 << 11) - 1;
    pub const PREV_MASK: u16 = (1 << START_ELAPSED_EQUALS_PREV)
        | (1 << DEPTH_EQUALS_PREV)
        | (1 << SERVICE_TYPE_EQUALS_PREV)
        | (1 << SEQUENCE_NEXT);
}

pub(crate) fn span_bitfield(span: &Span) -> Bitfield {
    let mut bitfield = Bitfield::default();
    bitfield.set(span_bits::ROOT, span.is_root());
    bitfield.set(span_bits::ERR_CODE, span.err_code.is_some());
    bitfield.set(span_bits::EXCEPTION, span.exception_info.is_some());
    bitfield.set(span_bits::FLAG, span.flag != 0);
    bitfield.set(span_bits::LOGGING_INFO, span.logging_transaction_info != 0);
    bitfield.set(span_bits::ANNOTATIONS, !span.annotations.is_empty());
    bitfield
}

/// Flags for `event`, compressed against the event written before it.
pub(crate) fn event_bitfield(event: &SpanEvent, prev: Option<&SpanEvent>) -> Bitfield {
    let mut bitfield = Bitfield::default();
    bitfield.set(event_bits::RPC, event.rpc.is_some());
    bitfield.set(event_bits::END_POINT, event.end_point.is_some());
    bitfield.set(event_bits::DESTINATION_ID, event.destination_id.is_some());
    bitfield.set(event_bits::NEXT_SPAN_ID, event.next_span_id.is_some());
    bitfield.set(event_bits::ASYNC_ID, event.async_id.is_some());
    bitfield.set(event_bits::EXCEPTION, event.exception_info.is_some());
    bitfield.set(event_bits::ANNOTATIONS, !event.annotations.is_empty());
    if let Some(prev) = prev {
        bitfield.set(
            event_bits::START_ELAPSED_EQUALS_PREV,
            event.start_elapsed == prev.start_elapsed,
        );
        bitfield.set(event_bits::DEPTH_EQUALS_PREV, event.depth == prev.depth);
        bitfield.set(
            event_bits::SERVICE_TYPE_EQUALS_PREV,
            event.service_type == prev.service_type,
        );
        bitfield.set(
            event_bits::SEQUENCE_NEXT,
            event.sequence == prev.sequence.wrapping_add(1),
        );
    }
    bitfield
}

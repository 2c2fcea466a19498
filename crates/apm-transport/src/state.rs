// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};

use derive_more::Display;

/// Lifecycle of a streaming channel.
///
/// `Disconnected -> Connecting -> Streaming -> ReconnectScheduled -> Connecting -> ...`, with
/// `Closed` reachable from every state and never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ChannelState {
    #[display("disconnected")]
    Disconnected = 0,
    #[display("connecting")]
    Connecting = 1,
    #[display("streaming")]
    Streaming = 2,
    #[display("reconnect_scheduled")]
    ReconnectScheduled = 3,
    #[display("closed")]
    Closed = 4,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Connecting,
            2 => ChannelState::Streaming,
            3 => ChannelState::ReconnectScheduled,
            4 => ChannelState::Closed,
            _ => ChannelState::Disconnected,
        }
    }
}

/// Channel state shared between the dispatch task and observers.
#[derive(Debug)]
pub struct AtomicChannelState(AtomicU8);

impl Default for AtomicChannelState {
    fn default() -> Self {
        AtomicChannelState(AtomicU8::new(ChannelState::Disconnected as u8))
    }
}

impl AtomicChannelState {
    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the channel is already closed. Returns the previous state.
    pub fn transition(&self, next: ChannelState) -> ChannelState {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == ChannelState::Closed as u8 {
                return ChannelState::Closed;
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return ChannelState::from_u8(previous),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn close(&self) -> ChannelState {
        ChannelState::from_u8(self.0.swap(ChannelState::Closed as u8, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        let state = AtomicChannelState::default();
        assert_eq!(state.get(), ChannelState::Disconnected);
        assert_eq!(state.transition(ChannelState::Connecting), ChannelState::Disconnected);
        assert_eq!(state.transition(ChannelState::Streaming), ChannelState::Connecting);
        assert_eq!(state.close(), ChannelState::Streaming);
        assert_eq!(state.transition(ChannelState::Connecting), ChannelState::Closed);
        assert_eq!(state.get(), ChannelState::Closed);
        assert_eq!(state.get().to_string(), "closed");
    }
}

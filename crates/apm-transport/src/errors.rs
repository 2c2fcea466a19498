// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use apm_codec::{DecodeError, EncodeError};

/// Failures on the network side of a channel.
///
/// These never reach telemetry producers. Streaming channels answer them with a reconnect and
/// metadata requests with a retry.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("transport is shut down")]
    Shutdown,
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer is stopped")]
    Stopped,
    #[error("too many pending timeouts ({pending}), limit is {max_pending}")]
    TooManyPending { pending: usize, max_pending: usize },
}

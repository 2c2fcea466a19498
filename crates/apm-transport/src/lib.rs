// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod channel;
pub mod client;
pub mod config;
pub mod counters;
pub mod errors;
pub mod metadata;
pub mod reconnector;
pub mod state;
pub mod streaming;
pub mod tcp;
pub mod timer;
pub mod transport;

pub use channel::{ChannelKind, Frame};
pub use client::{ClientStream, StreamConnector, UnaryClient};
pub use config::TransportConfig;
pub use counters::TransportCounters;
pub use errors::{TimerError, TransportError};
pub use state::ChannelState;
pub use timer::{HashedWheelTimer, Timeout};
pub use transport::TelemetryTransport;

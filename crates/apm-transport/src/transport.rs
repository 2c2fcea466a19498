// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use apm_codec::message::TelemetryMessage;
use apm_codec::EncodeError;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::channel::{outbound_call, ChannelKind, Frame, OutboundCall};
use crate::client::{StreamConnector, UnaryClient};
use crate::config::TransportConfig;
use crate::counters::TransportCounters;
use crate::metadata::MetadataSender;
use crate::state::ChannelState;
use crate::streaming::StreamingSender;
use crate::tcp::{TcpStreamConnector, TcpUnaryClient};
use crate::timer::HashedWheelTimer;

/// Agent-side entry point: one span channel, one stat channel and one metadata channel sharing a
/// single timer.
pub struct TelemetryTransport {
    span: StreamingSender,
    stat: StreamingSender,
    metadata: MetadataSender,
    timer: Arc<HashedWheelTimer>,
    shutdown: AtomicBool,
}

impl TelemetryTransport {
    pub fn new(
        config: &TransportConfig,
        span_connector: Arc<dyn StreamConnector>,
        stat_connector: Arc<dyn StreamConnector>,
        metadata_client: Arc<dyn UnaryClient>,
    ) -> Self {
        let timer = HashedWheelTimer::start(
            config.timer_tick,
            config.timer_wheel_size,
            config.timer_max_pending_timeouts,
        );
        let backoff = Backoff::new(config.reconnect_delay, config.reconnect_max_delay);
        TelemetryTransport {
            span: StreamingSender::start(
                ChannelKind::Span,
                config.span_queue_size,
                span_connector,
                Arc::clone(&timer),
                backoff,
            ),
            stat: StreamingSender::start(
                ChannelKind::Stat,
                config.stat_queue_size,
                stat_connector,
                Arc::clone(&timer),
                backoff,
            ),
            metadata: MetadataSender::start(
                config.metadata_queue_size,
                metadata_client,
                Arc::clone(&timer),
                config.metadata_retry_delay,
                config.metadata_retry_max_count,
            ),
            timer,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Transport connecting to the collector over TCP.
    pub fn connect_tcp(config: &TransportConfig) -> Self {
        info!(
            "Sending telemetry to {} (span {}, stat {}, metadata {})",
            config.collector_host, config.span_port, config.stat_port, config.metadata_port
        );
        Self::new(
            config,
            Arc::new(TcpStreamConnector::new(
                config.span_address(),
                config.max_frame_length,
            )),
            Arc::new(TcpStreamConnector::new(
                config.stat_address(),
                config.max_frame_length,
            )),
            Arc::new(TcpUnaryClient::new(
                config.metadata_address(),
                config.max_frame_length,
                config.metadata_request_timeout,
            )),
        )
    }

    /// Encodes and enqueues a message. `Ok(false)` means it was dropped, an `Err` means it could
    /// not be encoded.
    pub fn send(&self, message: &TelemetryMessage) -> Result<bool, EncodeError> {
        let frame = Frame::new(message.kind(), message.encode()?);
        Ok(self.send_frame(frame))
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        match outbound_call(frame.kind) {
            OutboundCall::Stream(ChannelKind::Span) => self.span.send(frame),
            OutboundCall::Stream(ChannelKind::Stat) => self.stat.send(frame),
            OutboundCall::Stream(ChannelKind::Metadata) | OutboundCall::Request => {
                self.metadata.send(frame)
            }
            OutboundCall::Inbound => {
                warn!("Refusing to send inbound {} frame", frame.kind);
                false
            }
        }
    }

    pub fn counters(&self, channel: ChannelKind) -> &Arc<TransportCounters> {
        match channel {
            ChannelKind::Span => self.span.counters(),
            ChannelKind::Stat => self.stat.counters(),
            ChannelKind::Metadata => self.metadata.counters(),
        }
    }

    /// State of a streaming channel. Metadata has no stream.
    pub fn channel_state(&self, channel: ChannelKind) -> Option<ChannelState> {
        match channel {
            ChannelKind::Span => Some(self.span.state()),
            ChannelKind::Stat => Some(self.stat.state()),
            ChannelKind::Metadata => None,
        }
    }

    pub fn timer(&self) -> &Arc<HashedWheelTimer> {
        &self.timer
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shuts the transport down in order: flag every channel, stop the timer, then release the
    /// connections. Only the first call does anything.
    pub async fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.span.shutdown();
        self.stat.shutdown();
        self.metadata.shutdown();

        let cancelled = self.timer.stop();

        self.span.close().await;
        self.stat.close().await;
        self.metadata.close().await;
        info!(
            "Telemetry transport closed, {} pending timeouts cancelled",
            cancelled
        );
    }
}

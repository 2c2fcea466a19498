// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm_codec::message::{Ack, MessageKind, SqlMetaData, TelemetryMessage};
use apm_transport::backoff::Backoff;
use apm_transport::streaming::StreamingSender;
use apm_transport::{
    ChannelKind, ChannelState, ClientStream, Frame, HashedWheelTimer, StreamConnector,
    TelemetryTransport, TransportConfig, TransportError, UnaryClient,
};
use async_trait::async_trait;
use bytes::Bytes;

fn test_config() -> TransportConfig {
    TransportConfig {
        span_queue_size: 4,
        stat_queue_size: 4,
        metadata_queue_size: 4,
        metadata_retry_delay: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
        reconnect_max_delay: Duration::from_millis(400),
        timer_tick: Duration::from_millis(10),
        ..TransportConfig::default()
    }
}

fn span_frame(n: u8) -> Frame {
    Frame::new(MessageKind::Span, Bytes::copy_from_slice(&[1, n]))
}

#[derive(Default)]
struct RefusingConnector {
    attempts: AtomicU32,
}

#[async_trait]
impl StreamConnector for RefusingConnector {
    async fn connect(&self) -> Result<Box<dyn ClientStream>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::ConnectionClosed)
    }
}

/// Records delivered frames. The first stream breaks on its `fail_at`-th write.
struct RecordingConnector {
    delivered: Arc<Mutex<Vec<Frame>>>,
    connections: AtomicU32,
    fail_at: usize,
}

impl RecordingConnector {
    fn new(fail_at: usize) -> Self {
        RecordingConnector {
            delivered: Arc::new(Mutex::new(Vec::new())),
            connections: AtomicU32::new(0),
            fail_at,
        }
    }

    fn delivered(&self) -> Vec<Frame> {
        self.delivered.lock().unwrap().clone()
    }
}

struct RecordingStream {
    delivered: Arc<Mutex<Vec<Frame>>>,
    writes: usize,
    fail_at: Option<usize>,
}

#[async_trait]
impl ClientStream for RecordingStream {
    async fn on_next(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.writes += 1;
        if self.fail_at == Some(self.writes) {
            return Err(TransportError::ConnectionClosed);
        }
        self.delivered.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn on_completed(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        futures::future::pending::<()>().await;
        TransportError::ConnectionClosed
    }
}

#[async_trait]
impl StreamConnector for RecordingConnector {
    async fn connect(&self) -> Result<Box<dyn ClientStream>, TransportError> {
        let connection = self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingStream {
            delivered: Arc::clone(&self.delivered),
            writes: 0,
            fail_at: (connection == 0).then_some(self.fail_at),
        }))
    }
}

/// Connects to a peer that accepts the stream but never reads from it.
#[derive(Default)]
struct StalledConnector {
    writes: Arc<AtomicU32>,
}

struct StalledStream {
    writes: Arc<AtomicU32>,
}

#[async_trait]
impl ClientStream for StalledStream {
    async fn on_next(&mut self, _frame: &Frame) -> Result<(), TransportError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn on_completed(&mut self) -> Result<(), TransportError> {
        futures::future::pending::<()>().await;
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        futures::future::pending::<()>().await;
        TransportError::ConnectionClosed
    }
}

#[async_trait]
impl StreamConnector for StalledConnector {
    async fn connect(&self) -> Result<Box<dyn ClientStream>, TransportError> {
        Ok(Box::new(StalledStream {
            writes: Arc::clone(&self.writes),
        }))
    }
}

#[derive(Default)]
struct AckingClient {
    requests: AtomicU32,
}

#[async_trait]
impl UnaryClient for AckingClient {
    async fn request(&self, request_id: u64, frame: &Frame) -> Result<Ack, TransportError> {
        assert_eq!(frame.kind, MessageKind::SqlMetaData);
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(Ack {
            request_id,
            success: true,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_drops_exact_excess() {
    let connector = Arc::new(RefusingConnector::default());
    let transport = TelemetryTransport::new(
        &test_config(),
        connector.clone(),
        Arc::new(RefusingConnector::default()),
        Arc::new(AckingClient::default()),
    );

    let accepted = (0..10).filter(|n| transport.send_frame(span_frame(*n))).count();
    assert_eq!(accepted, 4);
    assert_eq!(transport.counters(ChannelKind::Span).dropped(), 6);
    assert_eq!(transport.counters(ChannelKind::Stat).dropped(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(connector.attempts.load(Ordering::SeqCst) > 1);
    assert!(transport.counters(ChannelKind::Span).reconnect_count() > 0);

    // Frames still queued at close are dropped too.
    transport.close().await;
    assert_eq!(transport.counters(ChannelKind::Span).dropped(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_resent_first_after_reconnect() {
    let connector = Arc::new(RecordingConnector::new(2));
    let transport = TelemetryTransport::new(
        &test_config(),
        connector.clone(),
        Arc::new(RefusingConnector::default()),
        Arc::new(AckingClient::default()),
    );

    for n in 1..=4 {
        assert!(transport.send_frame(span_frame(n)));
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(connector.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        connector.delivered(),
        (1..=4).map(span_frame).collect::<Vec<_>>()
    );
    assert_eq!(transport.counters(ChannelKind::Span).flush_count(), 4);
    assert_eq!(
        transport.channel_state(ChannelKind::Span),
        Some(ChannelState::Streaming)
    );
    transport.close().await;
    assert_eq!(transport.counters(ChannelKind::Span).dropped(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_metadata_goes_through_unary_client() {
    let client = Arc::new(AckingClient::default());
    let transport = TelemetryTransport::new(
        &test_config(),
        Arc::new(RefusingConnector::default()),
        Arc::new(RefusingConnector::default()),
        client.clone(),
    );

    let sql = TelemetryMessage::SqlMetaData(SqlMetaData {
        agent_id: "agent-1".into(),
        agent_start_time: 1_700_000_000_000,
        sql_id: 3,
        sql: "SELECT 1".into(),
    });
    assert_eq!(transport.send(&sql), Ok(true));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.requests.load(Ordering::SeqCst), 1);
    assert_eq!(transport.counters(ChannelKind::Metadata).flush_count(), 1);

    // Ack frames only travel from collector to agent.
    assert!(!transport.send_frame(Frame::new(MessageKind::Ack, Bytes::new())));
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let connector = Arc::new(RecordingConnector::new(usize::MAX));
    let transport = TelemetryTransport::new(
        &test_config(),
        connector.clone(),
        Arc::new(RefusingConnector::default()),
        Arc::new(AckingClient::default()),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.close().await;
    transport.close().await;

    assert!(transport.is_closed());
    assert!(transport.timer().is_stopped());
    assert_eq!(transport.timer().pending_timeouts(), 0);
    assert_eq!(
        transport.channel_state(ChannelKind::Span),
        Some(ChannelState::Closed)
    );
    assert_eq!(
        transport.channel_state(ChannelKind::Stat),
        Some(ChannelState::Closed)
    );

    assert!(!transport.send_frame(span_frame(1)));
    assert_eq!(transport.counters(ChannelKind::Span).dropped(), 1);
    assert!(connector.delivered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unencodable_message_is_an_error() {
    let transport = TelemetryTransport::new(
        &test_config(),
        Arc::new(RefusingConnector::default()),
        Arc::new(RefusingConnector::default()),
        Arc::new(AckingClient::default()),
    );
    let sql = TelemetryMessage::SqlMetaData(SqlMetaData {
        agent_id: String::new(),
        agent_start_time: 0,
        sql_id: 1,
        sql: "SELECT 1".into(),
    });
    assert!(transport.send(&sql).is_err());
    transport.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_continue_while_timer_is_saturated() {
    let timer = HashedWheelTimer::start(Duration::from_millis(10), 8, 1);
    let _occupied = timer
        .new_timeout(Duration::from_secs(3600), || {})
        .unwrap();
    let connector = Arc::new(RefusingConnector::default());
    let sender = StreamingSender::start(
        ChannelKind::Span,
        4,
        connector.clone(),
        Arc::clone(&timer),
        Backoff::new(Duration::from_millis(20), Duration::from_millis(40)),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(connector.attempts.load(Ordering::SeqCst) > 1);
    assert_ne!(sender.state(), ChannelState::Closed);
    assert!(sender.send(span_frame(1)));
    assert_eq!(sender.counters().dropped(), 0);

    sender.close().await;
    assert_eq!(sender.state(), ChannelState::Closed);
    assert_eq!(sender.counters().dropped(), 1);
    assert_eq!(timer.stop(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_does_not_wait_for_stalled_write() {
    let connector = Arc::new(StalledConnector::default());
    let transport = TelemetryTransport::new(
        &test_config(),
        connector.clone(),
        Arc::new(RefusingConnector::default()),
        Arc::new(AckingClient::default()),
    );
    assert!(transport.send_frame(span_frame(1)));
    assert!(transport.send_frame(span_frame(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.writes.load(Ordering::SeqCst), 1);

    let closed = tokio::time::timeout(Duration::from_secs(5), transport.close()).await;
    assert!(closed.is_ok());
    assert_eq!(
        transport.channel_state(ChannelKind::Span),
        Some(ChannelState::Closed)
    );
    // The frame stuck in the write and the one still queued are both dropped.
    assert_eq!(transport.counters(ChannelKind::Span).dropped(), 2);
    assert_eq!(transport.counters(ChannelKind::Span).flush_count(), 0);
}

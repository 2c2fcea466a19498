// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelKind, Frame};
use crate::client::{ClientStream, StreamConnector};
use crate::counters::{FailureState, TransportCounters};
use crate::errors::TransportError;
use crate::reconnector::Reconnector;
use crate::state::{AtomicChannelState, ChannelState};
use crate::timer::HashedWheelTimer;

pub const FAILURE_LIMIT_COUNT: u32 = 3;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);
/// Upper bound on the half-close handshake when a channel shuts down.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(1);

/// Fire-and-forget sender of one streaming channel.
///
/// `send` only enqueues. A single dispatch task owns the connection and drains the queue in FIFO
/// order; when a write fails the frame is held and written first on the next connection.
pub struct StreamingSender {
    channel: ChannelKind,
    tx: mpsc::Sender<Frame>,
    state: Arc<AtomicChannelState>,
    counters: Arc<TransportCounters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSender {
    pub fn start(
        channel: ChannelKind,
        queue_size: usize,
        connector: Arc<dyn StreamConnector>,
        timer: Arc<HashedWheelTimer>,
        backoff: Backoff,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let state = Arc::new(AtomicChannelState::default());
        let counters = Arc::new(TransportCounters::default());
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            channel,
            rx,
            connector,
            reconnector: Reconnector::new(
                timer,
                backoff,
                FailureState::new(FAILURE_LIMIT_COUNT, FAILURE_WINDOW),
                Arc::clone(&counters),
            ),
            state: Arc::clone(&state),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
            pending: None,
        };
        let task = tokio::spawn(dispatcher.run());

        StreamingSender {
            channel,
            tx,
            state,
            counters,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enqueues a frame without waiting. Returns `false` and counts a drop when the queue is full
    /// or the channel is closed.
    pub fn send(&self, frame: Frame) -> bool {
        if self.cancel.is_cancelled() {
            self.counters.record_drop();
            debug!("Dropping {} frame, {} channel is closed", frame.kind, self.channel);
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                self.counters.record_drop();
                warn!(
                    "Dropping {} frame, {} channel queue is full",
                    frame.kind, self.channel
                );
                false
            }
            Err(TrySendError::Closed(frame)) => {
                self.counters.record_drop();
                debug!("Dropping {} frame, {} channel is closed", frame.kind, self.channel);
                false
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn counters(&self) -> &Arc<TransportCounters> {
        &self.counters
    }

    /// Stops accepting frames and tells the dispatch task to exit. Does not wait.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shuts down and waits until the connection is released. Idempotent.
    pub async fn close(&self) {
        self.shutdown();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("{} channel dispatch task failed: {}", self.channel, e);
            }
        }
    }
}

enum PumpExit {
    Cancelled,
    Disconnected(TransportError),
}

struct Dispatcher {
    channel: ChannelKind,
    rx: mpsc::Receiver<Frame>,
    connector: Arc<dyn StreamConnector>,
    reconnector: Reconnector,
    state: Arc<AtomicChannelState>,
    counters: Arc<TransportCounters>,
    cancel: CancellationToken,
    pending: Option<Frame>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            self.state.transition(ChannelState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(mut stream) => {
                    self.reconnector.reset();
                    self.state.transition(ChannelState::Streaming);
                    info!("{} channel connected", self.channel);
                    match self.pump(stream.as_mut()).await {
                        PumpExit::Cancelled => {
                            match tokio::time::timeout(COMPLETION_TIMEOUT, stream.on_completed())
                                .await
                            {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    debug!("{} channel completion failed: {}", self.channel, e);
                                }
                                Err(_) => {
                                    warn!(
                                        "{} channel completion timed out after {:?}",
                                        self.channel, COMPLETION_TIMEOUT
                                    );
                                }
                            }
                            break;
                        }
                        PumpExit::Disconnected(e) => {
                            warn!("{} channel disconnected: {}", self.channel, e);
                        }
                    }
                }
                Err(e) => {
                    debug!("{} channel connect failed: {}", self.channel, e);
                }
            }

            self.state.transition(ChannelState::ReconnectScheduled);
            if let Err(e) = self.reconnector.schedule() {
                // The timer is stopped, so the transport is closing.
                debug!("{} channel stops reconnecting: {}", self.channel, e);
                self.cancel.cancel();
                break;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.reconnector.wait() => {}
            }
        }
        self.finish();
    }

    async fn pump(&mut self, stream: &mut dyn ClientStream) -> PumpExit {
        if let Some(frame) = self.pending.take() {
            if let Some(exit) = self.write(stream, frame).await {
                return exit;
            }
        }

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                e = stream.closed() => return PumpExit::Disconnected(e),
                frame = self.rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return PumpExit::Cancelled,
                },
            };
            if let Some(exit) = self.write(stream, frame).await {
                return exit;
            }
        }
    }

    /// Writes one frame unless shutdown wins first. An undelivered frame is held in `pending`,
    /// to be resent after a reconnect or counted as dropped on close.
    async fn write(&mut self, stream: &mut dyn ClientStream, frame: Frame) -> Option<PumpExit> {
        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            written = stream.on_next(&frame) => Some(written),
        };
        match written {
            Some(Ok(())) => {
                self.counters.record_flush();
                None
            }
            Some(Err(e)) => {
                self.pending = Some(frame);
                Some(PumpExit::Disconnected(e))
            }
            None => {
                debug!("{} channel shut down during a write", self.channel);
                self.pending = Some(frame);
                Some(PumpExit::Cancelled)
            }
        }
    }

    fn finish(&mut self) {
        self.reconnector.close();
        self.rx.close();
        let mut dropped = u64::from(self.pending.take().is_some());
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.counters.record_drops(dropped);
            warn!(
                "{} channel closed with {} undelivered frames",
                self.channel, dropped
            );
        }
        self.state.close();
        info!("{} channel closed", self.channel);
    }
}

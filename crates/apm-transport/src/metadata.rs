// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::channel::Frame;
use crate::client::UnaryClient;
use crate::counters::TransportCounters;
use crate::timer::HashedWheelTimer;

#[derive(Debug, Clone)]
struct MetadataRequest {
    request_id: u64,
    frame: Frame,
    /// Zero for the first attempt.
    attempt: u32,
}

struct Inner {
    tx: mpsc::Sender<MetadataRequest>,
    timer: Arc<HashedWheelTimer>,
    retry_delay: Duration,
    max_attempts: u32,
    counters: Arc<TransportCounters>,
    shutdown: AtomicBool,
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn drop_request(&self, request: &MetadataRequest, reason: &str) {
        self.counters.record_drop();
        warn!(
            "Dropping {} request {} after {} attempts: {}",
            request.frame.kind,
            request.request_id,
            request.attempt + 1,
            reason
        );
    }
}

/// Sends metadata as acknowledged unary requests.
///
/// A request answered with a failure ack or lost to a transport error is retried after a fixed
/// delay, at most `max_attempts` times. Retries wait on the shared timer and re-enter the same
/// bounded queue as new requests.
pub struct MetadataSender {
    inner: Arc<Inner>,
    client: Arc<dyn UnaryClient>,
    next_request_id: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataSender {
    pub fn start(
        queue_size: usize,
        client: Arc<dyn UnaryClient>,
        timer: Arc<HashedWheelTimer>,
        retry_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let inner = Arc::new(Inner {
            tx,
            timer,
            retry_delay,
            max_attempts,
            counters: Arc::new(TransportCounters::default()),
            shutdown: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_worker(
            Arc::clone(&inner),
            rx,
            Arc::clone(&client),
            cancel.clone(),
        ));
        MetadataSender {
            inner,
            client,
            next_request_id: AtomicU64::new(1),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn send(&self, frame: Frame) -> bool {
        let request = MetadataRequest {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            frame,
            attempt: 0,
        };
        if self.inner.is_shutdown() {
            self.inner.counters.record_drop();
            debug!("Dropping {} request, transport is shut down", request.frame.kind);
            return false;
        }
        match self.inner.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request) | TrySendError::Closed(request)) => {
                self.inner.drop_request(&request, "metadata queue is full");
                false
            }
        }
    }

    pub fn counters(&self) -> &Arc<TransportCounters> {
        &self.inner.counters
    }

    /// Stops accepting requests. Retries that come due afterwards do nothing.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Shuts down, waits for the worker and releases the connection. Idempotent.
    pub async fn close(&self) {
        self.shutdown();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Metadata worker failed: {}", e);
            }
            self.client.close().await;
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<MetadataRequest>,
    client: Arc<dyn UnaryClient>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                inner.drop_request(&request, "transport is shut down");
                break;
            }
            outcome = client.request(request.request_id, &request.frame) => outcome,
        };
        match outcome {
            Ok(ack) if ack.success => {
                inner.counters.record_flush();
                debug!("{} request {} acknowledged", request.frame.kind, request.request_id);
            }
            Ok(_) => {
                debug!("{} request {} rejected by collector", request.frame.kind, request.request_id);
                schedule_next_retry(&inner, request);
            }
            Err(e) => {
                debug!("{} request {} failed: {}", request.frame.kind, request.request_id, e);
                schedule_next_retry(&inner, request);
            }
        }
    }

    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        inner.counters.record_drops(dropped);
        warn!("Metadata sender closed with {} queued requests", dropped);
    }
}

fn schedule_next_retry(inner: &Arc<Inner>, request: MetadataRequest) {
    if inner.is_shutdown() {
        inner.drop_request(&request, "transport is shut down");
        return;
    }
    let retry_count = request.attempt + 1;
    if retry_count > inner.max_attempts {
        inner.drop_request(&request, "retries exhausted");
        return;
    }

    let retry = MetadataRequest {
        attempt: retry_count,
        ..request.clone()
    };
    let weak = Arc::downgrade(inner);
    let scheduled = inner.timer.new_timeout(inner.retry_delay, move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.is_shutdown() {
            inner.drop_request(&retry, "transport is shut down");
            return;
        }
        if let Err(TrySendError::Full(retry) | TrySendError::Closed(retry)) = inner.tx.try_send(retry) {
            inner.drop_request(&retry, "metadata queue is full");
        }
    });
    if let Err(e) = scheduled {
        inner.drop_request(&request, &e.to_string());
    }
}

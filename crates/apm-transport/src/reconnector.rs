// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::counters::{FailureState, TransportCounters};
use crate::errors::TimerError;
use crate::timer::{HashedWheelTimer, Timeout};

/// Schedules reconnect attempts of one streaming channel on the shared timer.
///
/// Attempts back off exponentially and continue until [`Reconnector::close`]. When the timer is
/// saturated the attempt waits out its delay with a plain sleep instead.
pub struct Reconnector {
    timer: Arc<HashedWheelTimer>,
    backoff: Backoff,
    failures: FailureState,
    counters: Arc<TransportCounters>,
    shutdown: Arc<AtomicBool>,
    ready: Arc<Notify>,
    scheduled: Option<Timeout>,
    unscheduled_delay: Option<Duration>,
}

impl Reconnector {
    pub fn new(
        timer: Arc<HashedWheelTimer>,
        backoff: Backoff,
        failures: FailureState,
        counters: Arc<TransportCounters>,
    ) -> Self {
        Reconnector {
            timer,
            backoff,
            failures,
            counters,
            shutdown: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(Notify::new()),
            scheduled: None,
            unscheduled_delay: None,
        }
    }

    /// Records a failed connection and schedules the next attempt. Only a stopped timer is an
    /// error.
    pub fn schedule(&mut self) -> Result<(), TimerError> {
        self.failures.record_failure();
        let attempt = self.failures.consecutive_failures().saturating_sub(1);
        let delay = self.backoff.delay(attempt);
        if self.failures.is_failure() {
            warn!(
                "Channel failing after {} attempts, next reconnect in {:?}",
                self.failures.consecutive_failures(),
                delay
            );
        } else {
            debug!("Reconnect attempt {} in {:?}", attempt + 1, delay);
        }

        let shutdown = Arc::clone(&self.shutdown);
        let ready = Arc::clone(&self.ready);
        let scheduled = self.timer.new_timeout(delay, move || {
            if !shutdown.load(Ordering::Acquire) {
                ready.notify_one();
            }
        });
        match scheduled {
            Ok(timeout) => self.scheduled = Some(timeout),
            Err(TimerError::Stopped) => return Err(TimerError::Stopped),
            Err(e @ TimerError::TooManyPending { .. }) => {
                debug!("Reconnect not scheduled on the timer ({}), sleeping instead", e);
                self.unscheduled_delay = Some(delay);
            }
        }
        self.counters.record_reconnect();
        Ok(())
    }

    /// Waits for the scheduled attempt to come due.
    pub async fn wait(&mut self) {
        match self.unscheduled_delay.take() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => self.ready.notified().await,
        }
    }

    /// Records a successful connection.
    pub fn reset(&mut self) {
        self.failures.record_success();
        self.scheduled = None;
        self.unscheduled_delay = None;
    }

    pub fn is_failure(&self) -> bool {
        self.failures.is_failure()
    }

    /// Stops scheduling. A pending attempt is cancelled, one already firing is a no-op.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.unscheduled_delay = None;
        if let Some(timeout) = self.scheduled.take() {
            timeout.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reconnector(timer: &Arc<HashedWheelTimer>) -> Reconnector {
        Reconnector::new(
            Arc::clone(timer),
            Backoff::new(Duration::from_millis(100), Duration::from_millis(400)),
            FailureState::new(3, Duration::from_secs(60)),
            Arc::new(TransportCounters::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_after_backoff() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 64, 16);
        let mut reconnector = reconnector(&timer);
        reconnector.schedule().unwrap();
        reconnector.schedule().unwrap();

        let start = tokio::time::Instant::now();
        reconnector.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(reconnector.counters.reconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_attempt() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 64, 16);
        let mut reconnector = reconnector(&timer);
        reconnector.schedule().unwrap();
        assert_eq!(timer.pending_timeouts(), 1);
        reconnector.close();
        assert_eq!(timer.pending_timeouts(), 0);

        let waited = tokio::time::timeout(Duration::from_secs(1), reconnector.wait()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_timer_falls_back_to_sleep() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 8, 1);
        let _occupied = timer.new_timeout(Duration::from_secs(3600), || {}).unwrap();
        let mut reconnector = reconnector(&timer);
        reconnector.schedule().unwrap();
        assert_eq!(timer.pending_timeouts(), 1);

        let start = tokio::time::Instant::now();
        reconnector.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(reconnector.counters.reconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_refuses() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 8, 16);
        timer.stop();
        let mut reconnector = reconnector(&timer);
        assert_eq!(reconnector.schedule(), Err(TimerError::Stopped));
        assert_eq!(reconnector.counters.reconnect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_limit() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 64, 16);
        let mut reconnector = reconnector(&timer);
        for _ in 0..3 {
            reconnector.schedule().unwrap();
        }
        assert!(reconnector.is_failure());
        reconnector.reset();
        assert!(!reconnector.is_failure());
    }
}

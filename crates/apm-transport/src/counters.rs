// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Per-channel event counters. Writers are the channel internals, everything else only reads.
#[derive(Debug, Default)]
pub struct TransportCounters {
    flush_count: AtomicU64,
    reconnect_count: AtomicU64,
    dropped: AtomicU64,
    last_flush_millis: AtomicI64,
}

impl TransportCounters {
    pub(crate) fn record_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        self.last_flush_millis.store(now, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.record_drops(1);
    }

    pub(crate) fn record_drops(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Frames written to the network.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Records that never reached the network: rejected by a full queue, still queued at close,
    /// or given up on after the last retry.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Epoch millis of the last successful write, `0` before the first one.
    pub fn last_flush_timestamp(&self) -> i64 {
        self.last_flush_millis.load(Ordering::Relaxed)
    }
}

/// Tracks consecutive connection failures.
///
/// A channel is failing once `limit_count` attempts in a row failed, or once it has been failing
/// without a success for longer than `window`.
#[derive(Debug)]
pub struct FailureState {
    limit_count: u32,
    window: Duration,
    consecutive: u32,
    first_failure: Option<Instant>,
}

impl FailureState {
    pub fn new(limit_count: u32, window: Duration) -> Self {
        FailureState {
            limit_count: limit_count.max(1),
            window,
            consecutive: 0,
            first_failure: None,
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.first_failure.get_or_insert_with(Instant::now);
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
        self.first_failure = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn is_failure(&self) -> bool {
        if self.consecutive >= self.limit_count {
            return true;
        }
        self.first_failure
            .is_some_and(|since| since.elapsed() >= self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let counters = TransportCounters::default();
        assert_eq!(counters.flush_count(), 0);
        assert_eq!(counters.last_flush_timestamp(), 0);
        counters.record_flush();
        counters.record_drops(3);
        assert_eq!(counters.flush_count(), 1);
        assert_eq!(counters.dropped(), 3);
        assert!(counters.last_flush_timestamp() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_by_count_and_window() {
        let mut state = FailureState::new(3, Duration::from_secs(10));
        state.record_failure();
        state.record_failure();
        assert!(!state.is_failure());
        state.record_failure();
        assert!(state.is_failure());

        state.record_success();
        assert!(!state.is_failure());
        state.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(state.is_failure());
        assert_eq!(state.consecutive_failures(), 1);
    }
}

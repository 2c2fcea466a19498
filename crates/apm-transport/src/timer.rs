// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hashed wheel timer shared by every channel of a transport.
//!
//! Timeouts are hashed into `wheel_size` buckets by their deadline tick. A single worker task
//! advances the wheel once per `tick` and runs the tasks whose deadline has passed. Precision is
//! one tick, which is plenty for retry and reconnect delays.
//!
//! ```text
//!            cursor
//!              v
//!   [0] [1] [2] [3] ... [wheel_size - 1]
//!          |    |
//!          t1   t2 (deadline tick 3 + k * wheel_size)
//! ```
//!
//! A timeout is expired or cancelled by a single compare-and-swap out of `Init`. Whichever of
//! [`Timeout::cancel`] and the worker gets there first wins and the other becomes a no-op, so a
//! task never runs after a successful cancel and a cancel after the task started returns `false`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TimerError;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_WHEEL_SIZE: usize = 512;
pub const DEFAULT_MAX_PENDING_TIMEOUTS: usize = 4096;

type Task = Box<dyn FnOnce() + Send + 'static>;

const STATE_INIT: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

struct TimeoutState {
    state: AtomicU8,
    task: Mutex<Option<Task>>,
    pending: Arc<AtomicUsize>,
}

impl TimeoutState {
    fn transition(&self, to: u8) -> bool {
        let won = self
            .state
            .compare_exchange(STATE_INIT, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        won
    }

    fn take_task(&self) -> Option<Task> {
        lock(&self.task).take()
    }
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutState>,
}

impl Timeout {
    /// Cancels the task. Returns `false` when it already ran or was cancelled before.
    pub fn cancel(&self) -> bool {
        if self.inner.transition(STATE_CANCELLED) {
            drop(self.inner.take_task());
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CANCELLED
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_EXPIRED
    }
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}

struct Entry {
    deadline: u64,
    timeout: Arc<TimeoutState>,
}

struct Wheel {
    buckets: Vec<Vec<Entry>>,
    tick: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking task cannot leave the wheel half-updated, every mutation is a push or a drain.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct HashedWheelTimer {
    tick: Duration,
    max_pending: usize,
    wheel: Mutex<Wheel>,
    pending: Arc<AtomicUsize>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl HashedWheelTimer {
    /// Creates the timer and spawns its worker on the current runtime.
    pub fn start(tick: Duration, wheel_size: usize, max_pending: usize) -> Arc<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let wheel_size = wheel_size.max(1);
        let timer = Arc::new(HashedWheelTimer {
            tick,
            max_pending,
            wheel: Mutex::new(Wheel {
                buckets: (0..wheel_size).map(|_| Vec::new()).collect(),
                tick: 0,
            }),
            pending: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let worker = Arc::downgrade(&timer);
        let cancel = timer.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(timer) = worker.upgrade() else { break };
                        timer.advance();
                    }
                }
            }
            debug!("Timer worker stopped");
        });
        timer
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::start(DEFAULT_TICK, DEFAULT_WHEEL_SIZE, DEFAULT_MAX_PENDING_TIMEOUTS)
    }

    /// Schedules `task` to run on the timer worker after `delay`, rounded up to whole ticks.
    ///
    /// Tasks must not block: anything slow should be handed off to another task.
    pub fn new_timeout<F>(&self, delay: Duration, task: F) -> Result<Timeout, TimerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(TimerError::Stopped);
        }
        let pending = self.pending.load(Ordering::Acquire);
        if pending >= self.max_pending {
            return Err(TimerError::TooManyPending {
                pending,
                max_pending: self.max_pending,
            });
        }

        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()).max(1);
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        let timeout = Arc::new(TimeoutState {
            state: AtomicU8::new(STATE_INIT),
            task: Mutex::new(Some(Box::new(task))),
            pending: Arc::clone(&self.pending),
        });

        let mut wheel = lock(&self.wheel);
        // Re-checked under the lock so a concurrent stop() cannot miss this entry.
        if self.is_stopped() {
            return Err(TimerError::Stopped);
        }
        let deadline = wheel.tick.saturating_add(ticks);
        let bucket = (deadline % wheel.buckets.len() as u64) as usize;
        wheel.buckets[bucket].push(Entry {
            deadline,
            timeout: Arc::clone(&timeout),
        });
        self.pending.fetch_add(1, Ordering::AcqRel);
        drop(wheel);

        Ok(Timeout { inner: timeout })
    }

    fn advance(&self) {
        let due: Vec<Arc<TimeoutState>> = {
            let mut wheel = lock(&self.wheel);
            wheel.tick += 1;
            let current = wheel.tick;
            let bucket = (current % wheel.buckets.len() as u64) as usize;
            let entries = std::mem::take(&mut wheel.buckets[bucket]);
            let mut due = Vec::new();
            for entry in entries {
                if entry.timeout.state.load(Ordering::Acquire) != STATE_INIT {
                    continue;
                }
                if entry.deadline <= current {
                    due.push(entry.timeout);
                } else {
                    wheel.buckets[bucket].push(entry);
                }
            }
            due
        };

        // Run outside the lock so tasks can schedule follow-up timeouts.
        for timeout in due {
            if timeout.transition(STATE_EXPIRED) {
                if let Some(task) = timeout.take_task() {
                    task();
                }
            }
        }
    }

    /// Stops the worker and drops every pending task without running it. Returns how many tasks
    /// were dropped. Later calls return `0`.
    pub fn stop(&self) -> usize {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.cancel.cancel();

        let entries: Vec<Entry> = {
            let mut wheel = lock(&self.wheel);
            wheel.buckets.iter_mut().flat_map(std::mem::take).collect()
        };
        let dropped = entries
            .into_iter()
            .filter(|entry| {
                let won = entry.timeout.transition(STATE_CANCELLED);
                if won {
                    drop(entry.timeout.take_task());
                }
                won
            })
            .count();
        if dropped > 0 {
            warn!("Timer stopped with {} pending timeouts", dropped);
        } else {
            debug!("Timer stopped");
        }
        dropped
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_timeouts(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        self.tick
    }
}

impl Drop for HashedWheelTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counter_task(counter: &Arc<AtomicU32>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_after_delay() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 16);
        let fired = Arc::new(AtomicU32::new(0));
        let timeout = timer
            .new_timeout(Duration::from_millis(250), counter_task(&fired))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.pending_timeouts(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timeout.is_expired());
        assert_eq!(timer.pending_timeouts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_longer_than_one_rotation() {
        let timer = HashedWheelTimer::start(Duration::from_millis(10), 4, 16);
        let fired = Arc::new(AtomicU32::new(0));
        timer
            .new_timeout(Duration::from_millis(95), counter_task(&fired))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_expiry_wins() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 16);
        let fired = Arc::new(AtomicU32::new(0));
        let timeout = timer
            .new_timeout(Duration::from_millis(100), counter_task(&fired))
            .unwrap();

        assert!(timeout.cancel());
        assert!(!timeout.cancel());
        assert_eq!(timer.pending_timeouts(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timeout.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_expiry_is_noop() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 16);
        let fired = Arc::new(AtomicU32::new(0));
        let timeout = timer
            .new_timeout(Duration::from_millis(100), counter_task(&fired))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timeout.cancel());
        assert!(timeout.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_pending_is_enforced() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 2);
        timer.new_timeout(Duration::from_secs(1), || {}).unwrap();
        timer.new_timeout(Duration::from_secs(1), || {}).unwrap();
        assert_eq!(
            timer.new_timeout(Duration::from_secs(1), || {}).unwrap_err(),
            TimerError::TooManyPending {
                pending: 2,
                max_pending: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drops_pending_and_rejects_new() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 16);
        let fired = Arc::new(AtomicU32::new(0));
        let timeout = timer
            .new_timeout(Duration::from_millis(200), counter_task(&fired))
            .unwrap();

        assert_eq!(timer.stop(), 1);
        assert_eq!(timer.stop(), 0);
        assert!(timeout.is_cancelled());
        assert_eq!(timer.pending_timeouts(), 0);
        assert_eq!(
            timer.new_timeout(Duration::from_millis(1), || {}).unwrap_err(),
            TimerError::Stopped
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_can_schedule_follow_up() {
        let timer = HashedWheelTimer::start(Duration::from_millis(100), 8, 16);
        let fired = Arc::new(AtomicU32::new(0));
        let follow_up = counter_task(&fired);
        let weak = Arc::downgrade(&timer);
        timer
            .new_timeout(Duration::from_millis(100), move || {
                if let Some(timer) = weak.upgrade() {
                    timer
                        .new_timeout(Duration::from_millis(100), follow_up)
                        .unwrap();
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

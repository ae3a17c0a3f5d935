//! Pluggable time source
//!
//! The substrate never reads the wall clock directly. Workflows consume a
//! [`Clock`], which in production is [`SystemClock`] and in tests is
//! [`TestClock`] so simulated months run in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::cancel::CancelScope;
use crate::error::{Result, WorkflowError};

/// Abstract "now" plus a cancellable wait-until
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current instant
    fn now(&self) -> DateTime<Utc>;

    /// Completes at or after `deadline`, or fails with `Cancelled` when
    /// `scope` fires first
    async fn wait_until(&self, deadline: DateTime<Utc>, scope: &CancelScope) -> Result<()>;
}

/// Wall-clock time backed by the tokio timer
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

// tokio timers cap out around two years; wait in slices so arbitrarily far
// deadlines still work.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn wait_until(&self, deadline: DateTime<Utc>, scope: &CancelScope) -> Result<()> {
        loop {
            if scope.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let remaining = match (deadline - Utc::now()).to_std() {
                Ok(d) if !d.is_zero() => d,
                _ => return Ok(()),
            };
            let slice = remaining.min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = scope.cancelled() => return Err(WorkflowError::Cancelled),
            }
        }
    }
}

struct TestWaiter {
    target: DateTime<Utc>,
    seq: u64,
    tx: oneshot::Sender<()>,
}

struct TestClockState {
    now: DateTime<Utc>,
    next_seq: u64,
    waiters: Vec<TestWaiter>,
}

/// Manually advanced clock for tests
///
/// `set_current_time` both moves `now` forward and releases every pending
/// `wait_until` whose target is due, preserving FIFO order among waiters with
/// an equal target. Safe to advance from any thread.
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<TestClockState>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TestClockState {
                now: start,
                next_seq: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Advance the clock and release due waiters
    pub fn set_current_time(&self, now: DateTime<Utc>) {
        let released = {
            let mut state = self.state.lock();
            if now < state.now {
                // time only moves forward; ignore rewinds
                return;
            }
            state.now = now;
            let mut due: Vec<TestWaiter> = Vec::new();
            let mut remaining = Vec::with_capacity(state.waiters.len());
            for waiter in state.waiters.drain(..) {
                if waiter.target <= now {
                    due.push(waiter);
                } else {
                    remaining.push(waiter);
                }
            }
            state.waiters = remaining;
            due.sort_by_key(|w| (w.target, w.seq));
            due
        };
        trace!(waiters = released.len(), %now, "test clock advanced");
        for waiter in released {
            let _ = waiter.tx.send(());
        }
    }

    /// Advance by a delta from the current test time
    pub fn advance(&self, delta: chrono::Duration) {
        let target = self.state.lock().now + delta;
        self.set_current_time(target);
    }

    /// Number of registered waiters, for assertions
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    async fn wait_until(&self, deadline: DateTime<Utc>, scope: &CancelScope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let seq = {
            let mut state = self.state.lock();
            if deadline <= state.now {
                return Ok(());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(TestWaiter {
                target: deadline,
                seq,
                tx,
            });
            seq
        };

        tokio::select! {
            released = rx => match released {
                Ok(()) => Ok(()),
                // clock dropped while we waited
                Err(_) => Err(WorkflowError::Cancelled),
            },
            _ = scope.cancelled() => {
                let mut state = self.state.lock();
                state.waiters.retain(|w| w.seq != seq);
                Err(WorkflowError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_wait_until_past_deadline_completes_immediately() {
        let clock = TestClock::new(at(12, 0));
        let scope = CancelScope::new_root();
        assert_ok!(clock.wait_until(at(11, 0), &scope).await);
    }

    #[tokio::test]
    async fn test_advance_releases_due_waiters() {
        let clock = TestClock::new(at(12, 0));
        let scope = CancelScope::new_root();

        let waiting = {
            let clock = clock.clone();
            let scope = scope.clone();
            tokio::spawn(async move { clock.wait_until(at(12, 30), &scope).await })
        };

        // give the waiter a chance to register
        tokio::task::yield_now().await;
        while clock.waiter_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        clock.set_current_time(at(12, 15));
        assert_eq!(clock.waiter_count(), 1);

        clock.set_current_time(at(12, 30));
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_equal_targets_release_fifo() {
        let clock = TestClock::new(at(9, 0));
        let scope = CancelScope::new_root();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let clock = clock.clone();
            let scope = scope.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                clock.wait_until(at(10, 0), &scope).await.unwrap();
                order.lock().push(i);
            }));
            // serialize registration so seq order is deterministic
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        while clock.waiter_count() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        clock.set_current_time(at(10, 0));
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_removed() {
        let clock = TestClock::new(at(9, 0));
        let scope = CancelScope::new_root();

        let waiting = {
            let clock = clock.clone();
            let scope = scope.clone();
            tokio::spawn(async move { clock.wait_until(at(10, 0), &scope).await })
        };
        while clock.waiter_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        scope.cancel();
        let err = waiting.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(clock.waiter_count(), 0);
    }

    #[tokio::test]
    async fn test_rewind_is_ignored() {
        let clock = TestClock::new(at(12, 0));
        clock.set_current_time(at(11, 0));
        assert_eq!(clock.now(), at(12, 0));
    }
}

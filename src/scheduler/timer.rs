//! Clock and cancellable timer abstractions.
//!
//! Production uses [`SystemClock`] with [`TokioTimers`]. Tests use
//! [`ManualClock`], which implements both traits over virtual time and fires
//! due timers from [`ManualClock::advance`].

use crate::error::{ArbiterError, ArbiterResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot callbacks.
pub trait TimerDriver: Send + Sync {
    /// Run `callback` once after `delay` unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Cancels a scheduled callback. Dropping the handle leaves the timer armed.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Timers backed by tokio tasks: one sleeping task per armed timer, aborted
/// on cancel.
#[derive(Debug, Clone)]
pub struct TokioTimers {
    handle: Handle,
}

impl TokioTimers {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> ArbiterResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ArbiterError::Internal(format!("No tokio runtime for timers: {}", e)))
    }
}

impl TimerDriver for TokioTimers {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle::new(move || task.abort())
    }
}

pub(crate) fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct ManualState {
    now: DateTime<Utc>,
    next_seq: u64,
    timers: BTreeMap<(DateTime<Utc>, u64), TimerCallback>,
}

/// Virtual clock and timer driver for tests.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                next_seq: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of timers still waiting to fire.
    pub fn pending_timers(&self) -> usize {
        self.lock().timers.len()
    }

    /// Move time forward, firing every timer that falls due in deadline
    /// order. Callbacks run without the clock's lock held, so they may read
    /// the clock and schedule new timers.
    pub fn advance(&self, by: Duration) {
        let target = deadline_after(self.lock().now, by);

        loop {
            let due = {
                let mut state = self.lock();
                let key = match state.timers.keys().next() {
                    Some(key) if key.0 <= target => *key,
                    _ => break,
                };
                state.now = key.0;
                state.timers.remove(&key)
            };
            if let Some(callback) = due {
                callback();
            }
        }

        self.lock().now = target;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }
}

impl TimerDriver for ManualClock {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let key = {
            let mut state = self.lock();
            let key = (deadline_after(state.now, delay), state.next_seq);
            state.next_seq += 1;
            state.timers.insert(key, callback);
            key
        };

        let clock = self.clone();
        TimerHandle::new(move || {
            clock.lock().timers.remove(&key);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_manual_clock_fires_in_order() {
        let clock = ManualClock::default();
        let start = clock.now();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (label, ms) in [("late", 300u64), ("early", 100)] {
            let fired = fired.clone();
            let observer = clock.clone();
            let _handle = clock.schedule(
                Duration::from_millis(ms),
                Box::new(move || {
                    let elapsed = observer.now() - start;
                    fired.lock().unwrap().push((label, elapsed.num_milliseconds()));
                }),
            );
        }

        clock.advance(Duration::from_millis(150));
        assert_eq!(*fired.lock().unwrap(), vec![("early", 100)]);

        clock.advance(Duration::from_millis(150));
        assert_eq!(fired.lock().unwrap().len(), 2);
        assert_eq!(fired.lock().unwrap()[1], ("late", 300));
        assert_eq!((clock.now() - start).num_milliseconds(), 300);
    }

    #[test]
    fn test_manual_clock_cancel() {
        let clock = ManualClock::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = clock.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(clock.pending_timers(), 1);

        handle.cancel();
        clock.advance(Duration::from_secs(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_tokio_timers_fire_and_cancel() {
        let timers = TokioTimers::current().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let _kept = timers.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let counter = count.clone();
        let cancelled = timers.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            }),
        );
        cancelled.cancel();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

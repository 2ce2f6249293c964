//! Timer port used for every delay the client schedules.
//!
//! The push client never sleeps directly. Heartbeat windows, reconnection delays and
//! connection timeouts all go through a [`Clock`], which lets production code run on
//! the Tokio timer ([`TokioClock`]) while tests drive virtual time deterministically
//! with [`ManualClock`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Work to run once a scheduled delay elapses.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Source of time and one-shot timers.
pub trait Clock: Send + Sync {
    /// The current instant as seen by this clock.
    fn now(&self) -> Instant;

    /// Run `task` once after `delay`, unless the returned handle is cancelled or dropped first.
    ///
    /// Implementations must not run `task` synchronously from within `schedule`.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancellation handle for a scheduled timer.
///
/// Dropping the handle cancels the timer, so whoever owns the handle owns the timer.
/// Cancelling a timer that already fired is a no-op.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Create a handle that invokes `cancel` when cancelled or dropped.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the timer.
    pub fn cancel(mut self) {
        self.fire_cancel();
    }

    fn fire_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.fire_cancel();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// [`Clock`] backed by the Tokio timer.
///
/// Each scheduled task runs in its own spawned task that races the delay against a
/// [`CancellationToken`](tokio_util::sync::CancellationToken).
#[cfg(feature = "tokio-clock")]
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct TokioClock {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio-clock")]
impl TokioClock {
    /// Create a clock that spawns onto the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Create a clock bound to the runtime the caller is running in.
    pub fn current() -> crate::Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| crate::error::Error::with_source(crate::error::Kind::Internal, e))
    }
}

#[cfg(feature = "tokio-clock")]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let token = tokio_util::sync::CancellationToken::new();
        let child = token.clone();

        self.handle.spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {}
                () = tokio::time::sleep(delay) => task(),
            }
        });

        TimerHandle::new(move || token.cancel())
    }
}

/// Virtual-time [`Clock`] for deterministic tests.
///
/// Time only moves when [`advance`](ManualClock::advance) is called. Due tasks run in
/// deadline order (ties in scheduling order), outside the clock's lock, so a task may
/// schedule or cancel further timers; tasks scheduled during an advance run in the
/// same advance when their deadline falls inside it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    now: Instant,
    next_id: u64,
    timers: BTreeMap<(Instant, u64), TimerTask>,
}

impl std::fmt::Debug for ManualState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualState")
            .field("now", &self.now)
            .field("pending", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now: Instant::now(),
                next_id: 0,
                timers: BTreeMap::new(),
            })),
        }
    }

    /// Move virtual time forward by `by`, running every task that becomes due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + by;

        loop {
            let task = {
                let mut state = self.lock();
                let due = state
                    .timers
                    .first_key_value()
                    .map(|(key, _)| *key)
                    .filter(|(deadline, _)| *deadline <= target);

                match due {
                    Some(key) => {
                        state.now = state.now.max(key.0);
                        state.timers.remove(&key)
                    }
                    None => None,
                }
            };

            match task {
                Some(task) => task(),
                None => break,
            }
        }

        let mut state = self.lock();
        state.now = state.now.max(target);
    }

    /// Number of timers scheduled and not yet fired or cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().timers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.lock().now
    }

    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let key = {
            let mut state = self.lock();
            let key = (state.now + delay, state.next_id);
            state.next_id += 1;
            state.timers.insert(key, task);
            key
        };

        let weak: Weak<Mutex<ManualState>> = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                // The task is dropped after the guard to keep its captures out of the lock.
                let task = inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .timers
                    .remove(&key);
                drop(task);
            }
        })
    }
}

use std::time::{Duration, Instant};

use crate::clock::{Clock, TimerHandle};

/// Idle watchdog for a connected client.
///
/// Holds at most one timer. Every `arm` replaces (and thereby cancels) the previous
/// timer and bumps a sequence number; an expiry is only honoured when it carries the
/// current sequence, so a timer that fires while being replaced is ignored.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    timeout: Option<Duration>,
    timer: Option<TimerHandle>,
    seq: u64,
    last_event_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub(crate) fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            timer: None,
            seq: 0,
            last_event_at: None,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Restart the window from now. No-op when no timeout is configured.
    ///
    /// `on_expire` receives the sequence number to hand back to [`expire`](Self::expire).
    pub(crate) fn arm<F, T>(&mut self, clock: &dyn Clock, on_expire: F)
    where
        F: FnOnce(u64) -> T,
        T: FnOnce() + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return;
        };

        self.seq = self.seq.wrapping_add(1);
        self.last_event_at = Some(clock.now());
        self.timer = Some(clock.schedule(timeout, Box::new(on_expire(self.seq))));
    }

    pub(crate) fn disarm(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.timer = None;
    }

    /// Accept an expiry for `seq`, returning the time since the window last restarted.
    pub(crate) fn expire(&mut self, seq: u64, now: Instant) -> Option<Duration> {
        if seq != self.seq || self.timer.take().is_none() {
            return None;
        }

        let since = self.last_event_at.unwrap_or(now);
        Some(now.saturating_duration_since(since))
    }
}

use std::sync::Arc;
use std::time::Duration;

use super::config::ReconnectConfig;
use crate::backoff::BackoffStrategy;
use crate::clock::{Clock, TimerHandle};

/// Outcome of planning the next reconnection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The attempt budget is spent
    Exhausted,
    Retry { delay: Duration },
}

/// Owns the pending-reconnect timer and the attempt budget.
pub(crate) struct ReconnectionEngine {
    enabled: bool,
    max_attempts: u32,
    strategy: Arc<dyn BackoffStrategy>,
    timer: Option<TimerHandle>,
    seq: u64,
}

impl ReconnectionEngine {
    pub(crate) fn new(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts,
            strategy: config.resolved_strategy(),
            timer: None,
            seq: 0,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn plan(&self, attempt: u32) -> Plan {
        if attempt >= self.max_attempts {
            return Plan::Exhausted;
        }

        Plan::Retry {
            delay: self.strategy.delay(attempt),
        }
    }

    /// Arm the reconnect timer, replacing any pending one.
    pub(crate) fn schedule<F, T>(&mut self, clock: &dyn Clock, delay: Duration, on_fire: F)
    where
        F: FnOnce(u64) -> T,
        T: FnOnce() + Send + 'static,
    {
        self.seq = self.seq.wrapping_add(1);
        self.timer = Some(clock.schedule(delay, Box::new(on_fire(self.seq))));
    }

    /// Claim the timer identified by `seq`. `false` if it was cancelled or replaced meanwhile.
    pub(crate) fn take_due(&mut self, seq: u64) -> bool {
        seq == self.seq && self.timer.take().is_some()
    }

    pub(crate) fn cancel(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.timer = None;
    }
}

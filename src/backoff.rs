//! Reconnection delay strategies.
//!
//! A strategy maps a zero-based reconnection attempt index to the delay to wait before
//! that attempt. Strategies are pure apart from the jitter drawn by [`Exponential`].

use std::time::Duration;

use rand::Rng as _;

const DEFAULT_JITTER: Duration = Duration::from_secs(1);

/// Saturating Fibonacci multipliers used by [`Fibonacci`].
const FIBONACCI: [u32; 10] = [1, 1, 2, 3, 5, 8, 13, 21, 34, 55];

/// Computes the delay before a reconnection attempt.
///
/// Any `Fn(u32) -> Duration` closure is a strategy too:
///
/// ```
/// use std::time::Duration;
/// use pushstream_client::backoff::BackoffStrategy as _;
///
/// let halving = |attempt: u32| Duration::from_secs(8) / 2_u32.saturating_pow(attempt);
/// assert_eq!(halving.delay(1), Duration::from_secs(4));
/// ```
pub trait BackoffStrategy: Send + Sync {
    /// Delay before attempt number `attempt` (zero-based).
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// `min(initial · 2^attempt, max) + random[0, jitter)`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random amount added to every delay
    pub jitter: Duration,
}

impl Exponential {
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter: DEFAULT_JITTER,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay for `attempt` before jitter is added.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

impl BackoffStrategy for Exponential {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }

        let jitter = rand::rng().random_range(0..jitter_ms);
        base.saturating_add(Duration::from_millis(jitter))
    }
}

/// `min(increment · (attempt + 1), max)`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    pub increment: Duration,
    pub max_delay: Duration,
}

impl Linear {
    #[must_use]
    pub const fn new(increment: Duration, max_delay: Duration) -> Self {
        Self {
            increment,
            max_delay,
        }
    }
}

impl BackoffStrategy for Linear {
    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }
}

/// The same delay for every attempt.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed {
    pub delay: Duration,
}

impl Fixed {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for Fixed {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `min(base · fib[min(attempt, 9)], max)` where the Fibonacci table stops growing at 55.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fibonacci {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Fibonacci {
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }
}

impl BackoffStrategy for Fibonacci {
    fn delay(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt)
            .unwrap_or(usize::MAX)
            .min(FIBONACCI.len() - 1);

        self.base_delay
            .saturating_mul(FIBONACCI[index])
            .min(self.max_delay)
    }
}

/// Shorthand for [`Exponential::new`].
#[must_use]
pub const fn exponential(initial_delay: Duration, max_delay: Duration) -> Exponential {
    Exponential::new(initial_delay, max_delay)
}

/// Shorthand for [`Linear::new`].
#[must_use]
pub const fn linear(increment: Duration, max_delay: Duration) -> Linear {
    Linear::new(increment, max_delay)
}

/// Shorthand for [`Fixed::new`].
#[must_use]
pub const fn fixed(delay: Duration) -> Fixed {
    Fixed::new(delay)
}

/// Shorthand for [`Fibonacci::new`].
#[must_use]
pub const fn fibonacci(base_delay: Duration, max_delay: Duration) -> Fibonacci {
    Fibonacci::new(base_delay, max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    #[test]
    fn exponential_first_attempt_is_initial_plus_jitter() {
        let strategy = exponential(SECOND, CAP);

        for _ in 0..100 {
            let delay = strategy.delay(0);
            assert!(
                delay >= SECOND && delay < Duration::from_secs(2),
                "delay {delay:?} outside [1s, 2s)"
            );
        }
    }

    #[test]
    fn exponential_is_capped_before_jitter() {
        let strategy = exponential(SECOND, CAP);

        for _ in 0..100 {
            assert!(strategy.delay(5) <= Duration::from_secs(31), "cap exceeded");
        }
        assert_eq!(strategy.base_delay(5), CAP);
        assert_eq!(strategy.base_delay(u32::MAX), CAP);
    }

    #[test]
    fn exponential_without_jitter_is_deterministic() {
        let strategy = exponential(Duration::from_millis(100), CAP).with_jitter(Duration::ZERO);

        let delays: Vec<_> = (0..4).map(|attempt| strategy.delay(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn linear_grows_by_increment() {
        let strategy = linear(SECOND, Duration::from_secs(3));

        assert_eq!(strategy.delay(0), SECOND);
        assert_eq!(strategy.delay(1), Duration::from_secs(2));
        assert_eq!(strategy.delay(2), Duration::from_secs(3));
        assert_eq!(strategy.delay(10), Duration::from_secs(3));
    }

    #[test]
    fn fixed_ignores_attempt() {
        let strategy = fixed(Duration::from_millis(250));

        assert_eq!(strategy.delay(0), strategy.delay(1_000));
    }

    #[test]
    fn fibonacci_saturates_then_caps() {
        let strategy = fibonacci(SECOND, CAP);

        assert_eq!(strategy.delay(0), SECOND);
        assert_eq!(strategy.delay(4), Duration::from_secs(5));
        assert_eq!(strategy.delay(7), Duration::from_secs(21));
        assert_eq!(strategy.delay(10), CAP);
        assert_eq!(strategy.delay(u32::MAX), CAP);
    }

    #[test]
    fn deterministic_strategies_never_decrease() {
        let strategies: Vec<Box<dyn BackoffStrategy>> = vec![
            Box::new(linear(SECOND, CAP)),
            Box::new(fixed(SECOND)),
            Box::new(fibonacci(SECOND, CAP)),
            Box::new(exponential(SECOND, CAP).with_jitter(Duration::ZERO)),
        ];

        for strategy in &strategies {
            let delays: Vec<_> = (0..20).map(|attempt| strategy.delay(attempt)).collect();
            assert!(
                delays.windows(2).all(|pair| pair[0] <= pair[1]),
                "delays decreased: {delays:?}"
            );
            assert!(delays.iter().all(|delay| *delay <= CAP), "cap exceeded");
        }
    }

    #[test]
    fn closures_are_strategies() {
        let strategy = |attempt: u32| Duration::from_millis(u64::from(attempt) * 10);

        assert_eq!(strategy.delay(3), Duration::from_millis(30));
    }
}

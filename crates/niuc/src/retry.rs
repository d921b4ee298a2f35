use std::time::Duration;

/// A stateful backoff policy.
///
/// `next()` returns the delay before the next attempt and advances the
/// internal counter; `None` means the policy is exhausted and the caller
/// must stop retrying.
pub trait RetryStrategy: Send {
    /// Delay before the next attempt, or `None` once exhausted.
    fn next(&mut self) -> Option<Duration>;
    /// Restores the initial state after a successful attempt.
    fn reset(&mut self);
}

/// `base * 2^attempt`, capped by an attempt count.
#[derive(Debug, Clone)]
pub struct ExponentialRetryStrategy {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialRetryStrategy {
    /// Creates a strategy allowing `max_attempts` delays.
    ///
    /// # Examples
    ///
    /// ```
    /// use niuc::retry::{ExponentialRetryStrategy, RetryStrategy};
    /// use std::time::Duration;
    ///
    /// let mut retry = ExponentialRetryStrategy::new(Duration::from_millis(1000), 2);
    /// assert_eq!(retry.next(), Some(Duration::from_millis(1000)));
    /// assert_eq!(retry.next(), Some(Duration::from_millis(2000)));
    /// assert_eq!(retry.next(), None);
    /// ```
    #[must_use]
    pub const fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Attempts consumed since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl RetryStrategy for ExponentialRetryStrategy {
    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// `attempt * base` for attempts `1..=max_retries`.
#[derive(Debug, Clone)]
pub struct LinearRetryStrategy {
    base: Duration,
    max_retries: u32,
    attempt: u32,
}

impl LinearRetryStrategy {
    /// Creates a strategy allowing `max_retries` delays.
    #[must_use]
    pub const fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            attempt: 0,
        }
    }
}

impl RetryStrategy for LinearRetryStrategy {
    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.base.saturating_mul(self.attempt))
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

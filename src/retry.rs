// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry with exponential backoff and jitter.
//!
//! Transient failures (timeout, connection lost, rate limit) are retried up
//! to three times with a 1-second base delay doubling per attempt, jittered
//! by plus or minus twenty percent. Non-retryable errors short-circuit.

use std::time::Duration;

use rand::Rng;

/// Backoff configuration for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay multiplier per attempt.
    pub factor: f64,
    /// Proportional jitter applied to each delay.
    pub jitter: f64,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::constants::DEFAULT_MAX_RETRIES,
            base_delay: crate::constants::DEFAULT_RETRY_BASE_DELAY,
            factor: crate::constants::DEFAULT_BACKOFF_FACTOR,
            jitter: crate::constants::DEFAULT_RETRY_JITTER,
            max_delay: crate::constants::DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries. Useful in tests.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// A fast policy for tests: same shape, millisecond delays.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// The jittered delay before retrying after `attempt` (1-based) failed.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let spread = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64((capped * spread).max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

//! Bounded exponential backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget plus capped exponential backoff.
///
/// `delay = min(base * 2^attempt, max)`. There is no jitter, so the
/// schedule is deterministic for a given attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the base delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before retrying a failure raised on `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Any overflow is past the cap anyway.
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// True when a failure on `attempt` has used up the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// Decides what to do with a transient failure raised on `attempt`.
    #[must_use]
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.is_exhausted(attempt) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.delay_for_attempt(attempt),
            }
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver as `next_attempt` after `delay`.
    Retry {
        /// Attempt number of the redelivery.
        next_attempt: u32,
        /// Delay before redelivery.
        delay: Duration,
    },
    /// Budget exhausted; escalate.
    GiveUp,
}

//! Reconnect backoff calculation.
//!
//! The policy here is a pure function of the attempt number: exponential
//! growth from an initial delay, capped at a ceiling, with no jitter.

use std::time::Duration;

/// Exponential backoff bounds used between reconnect attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffPolicy {
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    /// Creates a policy from millisecond bounds.
    pub fn from_millis(initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based; `0` is treated as the first attempt. The result is
    /// `min(initial_backoff * 2^(attempt - 1), max_backoff)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_millis(1_000, 30_000)
    }
}

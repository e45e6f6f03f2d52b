//! Retry policy for failed deliveries.
//!
//! A delivery is attempted at most [`RetryPolicy::max_attempts`] times. Only
//! retryable [`crate::error::DeliveryError`]s are retried; the wait before
//! retry `n` (0-indexed) is `initial_delay × multiplier^n`, capped at
//! `max_delay`.
//!
//! ```rust
//! use std::time::Duration;
//! use resnotify::delivery::RetryPolicy;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 4,
//!     initial_delay_ms: 100,
//!     max_delay_ms: 1_000,
//!     multiplier: 2.0,
//! };
//!
//! assert_eq!(policy.delay(0), Duration::from_millis(100));
//! assert_eq!(policy.delay(1), Duration::from_millis(200));
//! assert_eq!(policy.delay(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 is treated as 1.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor between retries (`>= 1.0` recommended).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Fixed number of attempts with a constant delay.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = delay.as_millis();
        let ms = if ms > u64::MAX as u128 { u64::MAX } else { ms as u64 };
        Self {
            max_attempts,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
        }
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before retry `retry` (0 = before the second attempt).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let first_secs = Duration::from_millis(self.initial_delay_ms).as_secs_f64();
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = first_secs * self.multiplier.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

//! Retry policies
//!
//! Expected transient failures are modeled as values, not unwinding: a
//! [`RetryPolicy`] describes the attempt budget and the backoff curve, and
//! the lifecycle and query loops drive it explicitly so they can roll back,
//! rotate ports or reconnect between attempts.
//!
//! Lifecycle steps (login, forward, connect) use a fixed delay; query
//! execution uses exponential backoff with a 200 ms base, doubling per
//! attempt.

use std::time::Duration;

/// Attempt budget and backoff curve for a retried operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Backoff multiplier applied per attempt (1.0 = fixed delay)
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff with a 200 ms base, doubling per attempt
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

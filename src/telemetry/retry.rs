//! Retry with exponential backoff.

use std::time::Duration;

use log::{debug, warn};

use crate::error::DriverError;

/// How often and how patiently a failing call is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further one.
    pub base_delay: Duration,
    retryable: fn(&DriverError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(6, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// A policy that retries every error.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            retryable: |_| true,
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_retryable(mut self, retryable: fn(&DriverError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_retryable(&self, err: &DriverError) -> bool {
        (self.retryable)(err)
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift)
    }

    /// Decides what happens after attempt `attempt` failed with `err`.
    ///
    /// Returns the delay before the next attempt, or `None` when the budget
    /// is spent or the error is not retryable.
    pub fn next_delay(&self, label: &str, attempt: u32, err: &DriverError) -> Option<Duration> {
        if err.is_session_confusion() {
            debug!(
                "{}: session confusion on attempt {}/{}: {}",
                label, attempt, self.max_attempts, err
            );
        } else {
            warn!(
                "{}: attempt {}/{} failed: {}",
                label, attempt, self.max_attempts, err
            );
        }
        if attempt >= self.max_attempts || !self.is_retryable(err) {
            return None;
        }
        Some(self.delay_for(attempt))
    }
}

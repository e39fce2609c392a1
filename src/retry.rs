use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy attached to an activity call when it is scheduled. Recorded in
/// the `ActivityScheduled` event, so it cannot change for the call's lifetime.
///
/// The delay before attempt `n + 1` is
/// `min(first_retry_interval * backoff_coefficient^(n - 1), max_retry_interval)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub first_retry_interval: Duration,
    /// Total attempts including the first one. At least 1.
    pub max_attempts: u32,
    pub backoff_coefficient: f64,
    pub max_retry_interval: Duration,
    /// Upper bound on time since the first attempt started; no retry is
    /// started once it has elapsed.
    pub overall_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_retry_interval: Duration::from_secs(1),
            max_attempts: 3,
            backoff_coefficient: 2.0,
            max_retry_interval: Duration::from_secs(10),
            overall_timeout: Some(Duration::from_secs(100)),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and default backoff settings.
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Single attempt, no retries. Used for calls scheduled without a policy.
    pub fn no_retry() -> Self {
        Self {
            first_retry_interval: Duration::ZERO,
            max_attempts: 1,
            backoff_coefficient: 1.0,
            max_retry_interval: Duration::ZERO,
            overall_timeout: None,
        }
    }

    pub fn with_first_retry_interval(mut self, interval: Duration) -> Self {
        self.first_retry_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn without_overall_timeout(mut self) -> Self {
        self.overall_timeout = None;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.max(0.0).powi(exponent);
        let secs = self.first_retry_interval.as_secs_f64() * factor;
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_retry_interval),
            // Overflow or NaN: the cap is the only sensible answer
            Err(_) => self.max_retry_interval,
        }
    }

    /// Whether a retry should follow failed attempt `attempt` when `elapsed`
    /// has passed since the first attempt started.
    pub fn should_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match self.overall_timeout {
            Some(timeout) => elapsed < timeout,
            None => true,
        }
    }
}

//! Retry policy shared by activities, child workflows, and the ingestion guard.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff policy with an attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub maximum_interval: Option<Duration>,
    /// Total attempts including the first one. Zero means unlimited.
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Some(Duration::from_secs(30)),
            maximum_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between a fixed number of attempts.
    pub fn fixed(delay: Duration, maximum_attempts: u32) -> Self {
        Self {
            initial_interval: delay,
            backoff_coefficient: 1.0,
            maximum_interval: None,
            maximum_attempts,
        }
    }

    /// Policy used for child workflows when the caller supplies none.
    pub fn child_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(3),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 3,
        }
    }

    /// Whether another attempt may run after `attempts_made` attempts.
    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        self.maximum_attempts == 0 || attempts_made < self.maximum_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.maximum_interval {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

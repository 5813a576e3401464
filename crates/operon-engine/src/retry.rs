//! Exponential backoff schedule for queue redrives.
//!
//! The schedule is deliberately deterministic: a fixed base doubled per
//! attempt and capped, so operators can predict exactly when a session
//! will be retried from its `retry_count` alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy for the queue's redrive scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which an item permanently fails.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of a retry decision for a failed redrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry at the given time.
    Retry {
        /// When the item becomes eligible again.
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry; the item fails permanently.
    GiveUp {
        /// Attempts consumed.
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count` (1-based).
    ///
    /// `min(base * 2^(retry_count - 1), max)`; monotonically non-decreasing
    /// in `retry_count`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
    }

    /// Decides whether attempt number `retry_count` should happen.
    ///
    /// `retry_count` is the incremented count for the attempt under
    /// consideration; at `max_retries` the item gives up.
    pub fn decide(&self, retry_count: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::GiveUp { attempts: retry_count };
        }

        let delay = self.backoff_delay(retry_count);
        let next_attempt_at = failed_at
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        RetryDecision::Retry { next_attempt_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_minute() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(240));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(480));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(960));
    }

    #[test]
    fn backoff_caps_at_thirty_minutes() {
        let policy = RetryPolicy::default();

        // 2^5 minutes = 32 minutes would exceed the cap.
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(30 * 60));
        assert_eq!(policy.backoff_delay(12), Duration::from_secs(30 * 60));
    }

    #[test]
    fn backoff_is_monotonically_non_decreasing() {
        let policy = RetryPolicy::default();

        let mut previous = Duration::ZERO;
        for retry_count in 1..=30 {
            let delay = policy.backoff_delay(retry_count);
            assert!(delay >= previous, "delay decreased at retry {retry_count}");
            previous = delay;
        }
    }

    #[test]
    fn gives_up_at_max_retries() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();

        match policy.decide(5, failed_at) {
            RetryDecision::GiveUp { attempts } => assert_eq!(attempts, 5),
            RetryDecision::Retry { .. } => unreachable!("must give up at max retries"),
        }
    }

    #[test]
    fn schedules_before_max_retries() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();

        match policy.decide(4, failed_at) {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, failed_at + chrono::Duration::seconds(480));
            },
            RetryDecision::GiveUp { .. } => unreachable!("must retry below max retries"),
        }
    }
}

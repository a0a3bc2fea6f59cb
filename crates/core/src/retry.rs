//! Retry/backoff policy.
//!
//! Pure logic: given how many attempts a task has consumed, decide whether it
//! gets another one and when it becomes eligible again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `retrying`, eligible again at `scheduled_for`.
    Retry { scheduled_for: DateTime<Utc> },
    /// Attempts exhausted (or the failure is permanent): terminal `failed`.
    Exhausted,
}

/// Retry policy configuration.
///
/// `max_attempts` is not part of the policy: it is fixed per task at enqueue
/// time and travels with the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Optional ceiling on a single delay
    pub max_delay: Option<Duration>,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: None,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: None,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Cap every computed delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2_u32.saturating_pow(attempt - 1)),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// `attempts` is the count *including* the attempt that just failed.
    pub fn on_failure(
        &self,
        attempts: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        if !self.should_retry(attempts, max_attempts) {
            return FailureDisposition::Exhausted;
        }

        FailureDisposition::Retry {
            scheduled_for: add_delay(now, self.delay_for_attempt(attempts)),
        }
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn default_schedule_is_five_ten_twenty_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..RetryPolicy::exponential(Duration::from_millis(100))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn max_delay_caps_growth() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(12));

        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(12));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(12));
    }

    #[test]
    fn huge_attempt_counts_saturate_instead_of_overflowing() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_attempt(u32::MAX);
        assert!(delay >= policy.delay_for_attempt(40));

        let at = add_delay(t0(), Duration::MAX);
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn on_failure_retries_while_attempts_remain() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.on_failure(1, 3, t0()),
            FailureDisposition::Retry {
                scheduled_for: t0() + chrono::Duration::seconds(5)
            }
        );
        assert_eq!(
            policy.on_failure(2, 3, t0()),
            FailureDisposition::Retry {
                scheduled_for: t0() + chrono::Duration::seconds(10)
            }
        );
        assert_eq!(policy.on_failure(3, 3, t0()), FailureDisposition::Exhausted);
        assert_eq!(policy.on_failure(4, 3, t0()), FailureDisposition::Exhausted);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: the k-th retry is scheduled at now + B * 2^(k-1), strictly increasing in k.
            #[test]
            fn exponential_backoff_is_strictly_increasing(
                base_ms in 1u64..60_000,
                k in 1u32..20,
            ) {
                let policy = RetryPolicy::exponential(Duration::from_millis(base_ms));
                let now = t0();

                let expected = Duration::from_millis(base_ms) * 2_u32.pow(k - 1);
                prop_assert_eq!(policy.delay_for_attempt(k), expected);

                let this = policy.on_failure(k, k + 1, now);
                let next = policy.on_failure(k + 1, k + 2, now);
                match (this, next) {
                    (
                        FailureDisposition::Retry { scheduled_for: a },
                        FailureDisposition::Retry { scheduled_for: b },
                    ) => prop_assert!(a < b),
                    other => prop_assert!(false, "expected two retries, got {:?}", other),
                }
            }

            /// Property: once attempts reach max_attempts, failure is terminal.
            #[test]
            fn exhaustion_is_terminal(max in 1u32..50, extra in 0u32..10) {
                let policy = RetryPolicy::default();
                prop_assert_eq!(
                    policy.on_failure(max + extra, max, t0()),
                    FailureDisposition::Exhausted
                );
            }
        }
    }
}

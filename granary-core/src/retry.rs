//! Retry policy for failed upload stages
//!
//! A failed stage leaves the upload in its `failed_*` status and eligible
//! for re-scheduling until the attempt count for that stage exceeds
//! `min_retry_attempts` *and* the upload has been failing for longer than
//! `retry_time_window`; then it aborts. The advisory `nextRetryTime` written
//! into upload metadata uses exponential backoff on the total attempt count.

use chrono::{DateTime, Duration, Utc};

/// Retry/abort policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// A stage may fail this many times before the time window is consulted
    pub min_retry_attempts: i64,

    /// Once attempts are exhausted, abort if the upload has been failing
    /// for longer than this window (measured from its first recorded timing)
    pub retry_time_window: Duration,

    /// Base delay for the first retry
    pub backoff_base: Duration,

    /// Cap on the exponential backoff delay
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_retry_attempts: 3,
            retry_time_window: Duration::minutes(180),
            backoff_base: Duration::seconds(60),
            backoff_cap: Duration::minutes(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, doubling per attempt and capped.
    pub fn backoff(&self, attempts: i64) -> Duration {
        let exponent = attempts.clamp(0, 32) as u32;
        let delay = self
            .backoff_base
            .checked_mul(2i32.saturating_pow(exponent))
            .unwrap_or(self.backoff_cap);
        std::cmp::min(delay, self.backoff_cap)
    }

    /// Whether a stage that just recorded its `attempt`-th failure should
    /// abort the upload instead of staying retryable.
    pub fn should_abort(
        &self,
        attempt: i64,
        first_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if attempt <= self.min_retry_attempts {
            return false;
        }
        match first_attempt_at {
            Some(first) => now - first > self.retry_time_window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::seconds(60));
        assert_eq!(policy.backoff(1), Duration::seconds(120));
        assert_eq!(policy.backoff(2), Duration::seconds(240));
        assert_eq!(policy.backoff(10), Duration::minutes(30));
        assert_eq!(policy.backoff(60), Duration::minutes(30));
    }

    #[test]
    fn test_no_abort_within_attempt_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let long_ago = now - Duration::hours(12);
        assert!(!policy.should_abort(3, Some(long_ago), now));
    }

    #[test]
    fn test_no_abort_within_time_window() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let recently = now - Duration::minutes(5);
        assert!(!policy.should_abort(10, Some(recently), now));
    }

    #[test]
    fn test_abort_after_attempts_and_window() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let long_ago = now - Duration::hours(12);
        assert!(policy.should_abort(4, Some(long_ago), now));
    }

    #[test]
    fn test_missing_first_attempt_never_aborts() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_abort(100, None, Utc::now()));
    }
}

use std::time::Duration;

/// Backoff configuration applied to every stage execution.
///
/// The delay starts at `base_delay`, doubles per attempt and is capped at
/// `max_delay`. The concrete values are configuration, not contract; the
/// fixed rule is a monotone non-decreasing delay with an upper bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Whether another attempt may follow a failure on attempt `attempt`
    /// (numbered from 1). A stage is abandoned only once the number of
    /// attempts exceeds `max_retries`, for `max_retries + 1` attempts total.
    pub fn allows_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt <= max_retries
    }

    /// Delay to sleep before the attempt following `attempt`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(10));
        assert_eq!(policy.backoff_for(30), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_is_monotone() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(5));
        let mut last = Duration::ZERO;
        for attempt in 1..40 {
            let delay = policy.backoff_for(attempt);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        // max_retries = 2: attempts 1 and 2 may be retried, attempt 3 is final.
        assert!(policy.allows_retry(1, 2));
        assert!(policy.allows_retry(2, 2));
        assert!(!policy.allows_retry(3, 2));
        // max_retries = 0: the first failure is terminal.
        assert!(!policy.allows_retry(1, 0));
    }
}

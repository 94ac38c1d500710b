//! Reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::CloseEvent;

/// Predicate deciding whether a close event is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&CloseEvent) -> bool + Send + Sync>;

/// Backoff configuration for reconnect attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt budget before pending operations are errored out.
    pub max_attempts: u32,
    /// Base delay, doubled per attempt.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Jitter applied symmetrically around the computed delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(7000),
            max_jitter: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-based): `min(base · 2^attempt, max)`
    /// plus or minus jitter.
    #[must_use]
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(max_ms);

        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return Duration::from_millis(delay_ms);
        }
        let offset = rand::thread_rng().gen_range(0..=jitter_ms.saturating_mul(2));
        let jittered = delay_ms
            .saturating_add(offset)
            .saturating_sub(jitter_ms);
        Duration::from_millis(jittered)
    }
}

/// Default fatality policy for close codes.
///
/// Normal closes, server errors, protocol violations, and all application
/// codes beyond 4499 are not retried.
#[must_use]
pub fn is_fatal_close_code(code: u16) -> bool {
    matches!(code, 1000 | 1001 | 1011 | 4400 | 4401 | 4409 | 4429) || (4500..=4999).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_without_jitter() -> RetryPolicy {
        RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy_without_jitter();
        assert_eq!(policy.wait_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.wait_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.wait_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.wait_for_attempt(3), Duration::from_millis(7000));
        assert_eq!(policy.wait_for_attempt(10), Duration::from_millis(7000));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let wait = policy.wait_for_attempt(1);
            assert!(wait >= Duration::from_millis(1700));
            assert!(wait <= Duration::from_millis(2300));
        }
    }

    #[test]
    fn fatal_close_codes() {
        for code in [1000, 1001, 1011, 4400, 4401, 4409, 4429, 4500, 4999] {
            assert!(is_fatal_close_code(code), "{code} should be fatal");
        }
        for code in [1006, 4000, 4100, 4403, 4406, 4408, 4499] {
            assert!(!is_fatal_close_code(code), "{code} should be retryable");
        }
    }
}

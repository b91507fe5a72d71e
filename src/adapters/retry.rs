//! Retry policy for upstream requests
//!
//! Kept as a pure function of (attempt, error) so the backoff math is testable
//! without timers.

use std::time::Duration;

/// Whether a failure is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded exponential backoff: `min(base * 2^attempt, max_delay)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Decide what to do after attempt `attempt` (0-based) failed with `error`
    pub fn decide<E: Retryable + ?Sized>(&self, attempt: u32, error: &E) -> RetryDecision {
        if !error.is_retryable() || attempt + 1 >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.backoff(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Transient;
    struct Permanent;

    impl Retryable for Transient {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    impl Retryable for Permanent {
        fn is_retryable(&self) -> bool {
            false
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(5000));
        assert_eq!(policy.backoff(40), Duration::from_millis(5000));
    }

    #[test]
    fn retries_transient_until_attempts_exhausted() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, &Transient),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
        assert_eq!(
            policy.decide(1, &Transient),
            RetryDecision::RetryAfter(Duration::from_millis(2000))
        );
        assert_eq!(policy.decide(2, &Transient), RetryDecision::GiveUp);
    }

    #[test]
    fn never_retries_permanent_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, &Permanent), RetryDecision::GiveUp);
    }

    #[test]
    fn single_attempt_policy_gives_up_immediately() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        assert_eq!(policy.decide(0, &Transient), RetryDecision::GiveUp);
    }
}

//! Retry decisions.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt number, the
//! failure and the configuration (plus jitter, when enabled). Attempt `n`
//! backs off for `base_delay * 2^n`, capped at `max_delay`:
//!
//! | attempt | base 100ms |
//! |---------|------------|
//! | 1       | 200ms      |
//! | 2       | 400ms      |
//! | 3       | 800ms      |
//!
//! Jitter scales the delay by a uniform factor in `[0.5, 1.0]` so records
//! that failed together do not retry together. A throttled failure that
//! carries a `retry_after` hint never waits less than the hint.

use fanout_common::config::RetryConfig;
use fanout_common::{FailureClass, InvocationError};
use rand::Rng;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay
    Retry(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides whether attempt number `attempt` (starting at 1), which just
    /// failed with `failure`, is followed by another one.
    ///
    /// Gives up immediately on `Fatal`, and once `attempt` reaches the
    /// attempt budget.
    ///
    /// # Example
    ///
    /// ```
    /// use fanout_common::config::RetryConfig;
    /// use fanout_common::InvocationError;
    /// use fanout_engine::retry::{RetryDecision, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(RetryConfig::new(3).with_jitter(false));
    /// let failure = InvocationError::transient("connection reset");
    ///
    /// assert_eq!(policy.decide(1, &failure), RetryDecision::Retry(Duration::from_millis(200)));
    /// assert_eq!(policy.decide(3, &failure), RetryDecision::GiveUp);
    /// ```
    pub fn decide(&self, attempt: u32, failure: &InvocationError) -> RetryDecision {
        if failure.class == FailureClass::Fatal {
            return RetryDecision::GiveUp;
        }
        if attempt >= self.config.max_attempts() {
            return RetryDecision::GiveUp;
        }

        let mut delay = self.backoff(attempt);
        if self.config.jitter {
            delay = delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0));
        }
        if let Some(retry_after) = failure.retry_after {
            delay = delay.max(retry_after);
        }

        RetryDecision::Retry(delay)
    }

    /// Un-jittered backoff after attempt `attempt`: `base_delay * 2^attempt`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.config.base_delay.checked_mul(factor))
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new(max_retries)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter(jitter),
        )
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy(10, false);
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));

        let failure = InvocationError::transient("reset");
        assert_eq!(
            policy.decide(2, &failure),
            RetryDecision::Retry(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_backoff_capped() {
        let policy = policy(100, false);
        assert_eq!(policy.backoff(8), Duration::from_millis(25_600));
        assert_eq!(policy.backoff(9), Duration::from_secs(30));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
        // 2^40 overflows u32
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_gives_up_at_budget() {
        let policy = policy(3, false);
        let failure = InvocationError::throttled("429");
        assert!(matches!(policy.decide(1, &failure), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(2, &failure), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(3, &failure), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let failure = InvocationError::transient("reset");
        assert_eq!(policy(0, false).decide(1, &failure), RetryDecision::GiveUp);
        assert_eq!(policy(1, false).decide(1, &failure), RetryDecision::GiveUp);
    }

    #[test]
    fn test_fatal_never_retried() {
        let policy = policy(10, false);
        let failure = InvocationError::fatal("400 Bad Request");
        assert_eq!(policy.decide(1, &failure), RetryDecision::GiveUp);
    }

    #[test]
    fn test_jitter_range() {
        let policy = policy(10, true);
        let failure = InvocationError::transient("reset");
        for _ in 0..1_000 {
            match policy.decide(3, &failure) {
                RetryDecision::Retry(delay) => {
                    assert!(delay >= Duration::from_micros(399_999), "{:?}", delay);
                    assert!(delay <= Duration::from_micros(800_001), "{:?}", delay);
                }
                RetryDecision::GiveUp => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_retry_after_hint_is_a_floor() {
        let policy = policy(10, false);
        let slow = InvocationError::throttled("429").with_retry_after(Duration::from_secs(5));
        assert_eq!(
            policy.decide(1, &slow),
            RetryDecision::Retry(Duration::from_secs(5))
        );

        let fast = InvocationError::throttled("429").with_retry_after(Duration::from_millis(10));
        assert_eq!(
            policy.decide(1, &fast),
            RetryDecision::Retry(Duration::from_millis(200))
        );
    }
}

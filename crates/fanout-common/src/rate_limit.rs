//! Token bucket used for burst control.
//!
//! The bucket starts full, refills continuously at a fixed rate and never
//! holds more than its capacity. It is a plain state machine driven by the
//! caller's clock; waiting and locking belong to the admission limiter.
//!
//! # Example
//!
//! ```
//! use fanout_common::rate_limit::TokenBucket;
//! use tokio::time::Instant;
//! use std::time::Duration;
//!
//! let start = Instant::now();
//! let mut bucket = TokenBucket::new(2, 1.0, start);
//!
//! assert!(bucket.try_consume(start));
//! assert!(bucket.try_consume(start));
//! assert!(!bucket.try_consume(start));
//! assert_eq!(bucket.time_until_next_token(), Duration::from_secs(1));
//!
//! assert!(bucket.try_consume(start + Duration::from_secs(1)));
//! ```

use std::time::Duration;
use tokio::time::Instant;

/// Shortest wait ever reported, so a waiter always lets the clock move.
const MIN_WAIT: Duration = Duration::from_micros(1);

/// Continuous-refill token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    /// Current number of available tokens
    tokens: f64,
    /// Last time the bucket was refilled
    last_update: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum tokens held
    /// * `refill_per_second` - Tokens minted per second
    /// * `now` - Reference time for the first refill
    pub fn new(capacity: u32, refill_per_second: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_second,
            tokens: capacity as f64,
            last_update: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Tokens available as of the last refill.
    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Adds the tokens minted since the last update, capped at capacity.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_update {
            return;
        }
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let new_tokens = elapsed * self.refill_per_second;
        self.tokens = (self.tokens + new_tokens).min(self.capacity);
        self.last_update = now;
    }

    /// Attempts to take one token.
    ///
    /// # Returns
    ///
    /// `true` if a token was consumed, `false` if the bucket is empty
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next whole token is minted, as of the last refill.
    ///
    /// Returns [`Duration::MAX`] for a bucket that never refills.
    pub fn time_until_next_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }

        let tokens_needed = 1.0 - self.tokens;
        let secs_needed = tokens_needed / self.refill_per_second;
        Duration::try_from_secs_f64(secs_needed)
            .unwrap_or(Duration::MAX)
            .max(MIN_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let now = Instant::now();
        let bucket = TokenBucket::new(5, 1.0, now);
        assert_eq!(bucket.available(), 5.0);
        assert_eq!(bucket.capacity(), 5);
        assert_eq!(bucket.time_until_next_token(), Duration::ZERO);
    }

    #[test]
    fn test_consume_until_empty() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(3, 1.0, now);

        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(bucket.try_consume(now));
        assert!(!bucket.try_consume(now));
    }

    #[test]
    fn test_refill_over_time() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 10.0, now);

        for _ in 0..10 {
            assert!(bucket.try_consume(now));
        }
        assert!(!bucket.try_consume(now));

        // 10 tokens/s, 250ms later two whole tokens are back
        let later = now + Duration::from_millis(250);
        assert!(bucket.try_consume(later));
        assert!(bucket.try_consume(later));
        assert!(!bucket.try_consume(later));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(4, 100.0, now);
        assert!(bucket.try_consume(now));

        bucket.refill(now + Duration::from_secs(60));
        assert_eq!(bucket.available(), 4.0);
    }

    #[test]
    fn test_time_until_next_token() {
        let now = Instant::now();
        // 500 tokens per minute: one every 120ms
        let mut bucket = TokenBucket::new(1, 500.0 / 60.0, now);
        assert!(bucket.try_consume(now));

        let wait = bucket.time_until_next_token();
        assert!(wait > Duration::from_millis(119));
        assert!(wait <= Duration::from_millis(121));
    }

    #[test]
    fn test_never_refilling_bucket() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1, 0.0, now);
        assert!(bucket.try_consume(now));
        assert_eq!(bucket.time_until_next_token(), Duration::MAX);
    }

    #[test]
    fn test_wait_is_never_zero_when_empty() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(1, 1e12, now);
        assert!(bucket.try_consume(now));
        assert!(bucket.time_until_next_token() >= MIN_WAIT);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let now = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(2, 1.0, now);
        assert!(bucket.try_consume(now));
        bucket.refill(now - Duration::from_secs(5));
        assert_eq!(bucket.available(), 1.0);
    }
}

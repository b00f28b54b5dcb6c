//! Run configuration.
//!
//! All knobs the engine recognises, grouped by the component that consumes
//! them. Every group has sensible defaults, `with_*` builder methods and a
//! `validate()` that rejects values the engine cannot honour.
//!
//! # Example
//!
//! ```
//! use fanout_common::config::{AdmissionConfig, DispatchConfig, RetryConfig};
//! use std::time::Duration;
//!
//! let config = DispatchConfig::new(AdmissionConfig::per_minute(50, 1000, 500))
//!     .with_retry(RetryConfig::new(5).with_base_delay(Duration::from_millis(250)));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.in_flight_ceiling, 200);
//! ```

use crate::error::{FanoutError, Result};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Concurrency cap and token-bucket settings for the admission limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum number of simultaneously held admission tokens
    pub concurrency_cap: usize,
    /// Maximum number of tokens the rate bucket holds (burst size)
    pub bucket_capacity: u32,
    /// Tokens minted per `refill_interval`
    pub refill_tokens: u32,
    pub refill_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 10,
            bucket_capacity: 100,
            refill_tokens: 50,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl AdmissionConfig {
    /// Creates an admission configuration.
    ///
    /// # Arguments
    ///
    /// * `concurrency_cap` - Maximum concurrent invocations
    /// * `bucket_capacity` - Burst size of the rate bucket
    /// * `refill_tokens` - Tokens added per `refill_interval`
    /// * `refill_interval` - Refill period
    pub fn new(
        concurrency_cap: usize,
        bucket_capacity: u32,
        refill_tokens: u32,
        refill_interval: Duration,
    ) -> Self {
        Self {
            concurrency_cap,
            bucket_capacity,
            refill_tokens,
            refill_interval,
        }
    }

    /// Refill expressed per second.
    pub fn per_second(concurrency_cap: usize, bucket_capacity: u32, tokens_per_second: u32) -> Self {
        Self::new(
            concurrency_cap,
            bucket_capacity,
            tokens_per_second,
            Duration::from_secs(1),
        )
    }

    /// Refill expressed per minute.
    ///
    /// ```
    /// use fanout_common::config::AdmissionConfig;
    ///
    /// let config = AdmissionConfig::per_minute(100, 1000, 500);
    /// assert!((config.refill_per_second() - 500.0 / 60.0).abs() < 1e-9);
    /// ```
    pub fn per_minute(concurrency_cap: usize, bucket_capacity: u32, tokens_per_minute: u32) -> Self {
        Self::new(
            concurrency_cap,
            bucket_capacity,
            tokens_per_minute,
            Duration::from_secs(60),
        )
    }

    pub fn with_concurrency_cap(mut self, concurrency_cap: usize) -> Self {
        self.concurrency_cap = concurrency_cap;
        self
    }

    pub fn with_bucket_capacity(mut self, bucket_capacity: u32) -> Self {
        self.bucket_capacity = bucket_capacity;
        self
    }

    pub fn with_refill(mut self, tokens: u32, interval: Duration) -> Self {
        self.refill_tokens = tokens;
        self.refill_interval = interval;
        self
    }

    /// Continuous refill rate in tokens per second.
    pub fn refill_per_second(&self) -> f64 {
        if self.refill_interval.is_zero() {
            return 0.0;
        }
        self.refill_tokens as f64 / self.refill_interval.as_secs_f64()
    }

    /// Validates the admission configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] if:
    /// - the concurrency cap is zero or above what a semaphore can hold
    /// - the bucket capacity is zero
    /// - the refill rate is zero (the bucket would never refill)
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_cap == 0 {
            return Err(FanoutError::configuration(
                "concurrency_cap must be greater than zero",
            ));
        }
        if self.concurrency_cap > Semaphore::MAX_PERMITS {
            return Err(FanoutError::Configuration(format!(
                "concurrency_cap must be <= {} (got {})",
                Semaphore::MAX_PERMITS,
                self.concurrency_cap
            )));
        }
        if self.bucket_capacity == 0 {
            return Err(FanoutError::configuration(
                "bucket_capacity must be greater than zero",
            ));
        }
        if self.refill_tokens == 0 || self.refill_interval.is_zero() {
            return Err(FanoutError::configuration(
                "refill rate must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempt budget per record; 0 and 1 both mean a single attempt
    pub max_retries: u32,
    /// Delay unit for exponential backoff: attempt `n` waits `base_delay * 2^n`
    pub base_delay: Duration,
    /// Upper bound for the computed backoff
    pub max_delay: Duration,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::new(1)
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts a record may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(FanoutError::Configuration(format!(
                "max_delay ({}ms) must be >= base_delay ({}ms)",
                self.max_delay.as_millis(),
                self.base_delay.as_millis()
            )));
        }
        Ok(())
    }
}

/// Settings for decoupled (buffered, batch-consuming) dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Maximum records per delivery
    pub batch_size: usize,
    /// How long a consumer waits to fill a batch
    pub poll_interval: Duration,
    /// Total records the buffer holds before enqueue blocks
    pub buffer_capacity: usize,
    /// Independent lanes when ordering is not required
    pub partitions: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
            buffer_capacity: 100,
            partitions: 1,
        }
    }
}

impl BatchConfig {
    pub fn new(batch_size: usize, poll_interval: Duration) -> Self {
        Self {
            batch_size,
            poll_interval,
            ..Self::default()
        }
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FanoutError::configuration(
                "batch_size must be greater than zero",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(FanoutError::configuration(
                "poll_interval must be greater than zero",
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(FanoutError::configuration(
                "buffer_capacity must be greater than zero",
            ));
        }
        if self.partitions == 0 {
            return Err(FanoutError::configuration(
                "partitions must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Complete configuration for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub admission: AdmissionConfig,
    pub retry: RetryConfig,
    /// Records pulled from the source but not yet terminal, at most
    pub in_flight_ceiling: usize,
    /// Deliver in source order; implies decoupled mode with one partition
    pub ordering_required: bool,
    /// Decoupled mode settings; `None` dispatches directly
    pub batch: Option<BatchConfig>,
    /// Wall-clock budget after which the run is cancelled
    pub deadline: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

impl DispatchConfig {
    /// Creates a direct-mode configuration with an in-flight ceiling of four
    /// times the concurrency cap.
    pub fn new(admission: AdmissionConfig) -> Self {
        let in_flight_ceiling = admission.concurrency_cap.saturating_mul(4);
        Self {
            admission,
            retry: RetryConfig::default(),
            in_flight_ceiling,
            ordering_required: false,
            batch: None,
            deadline: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_in_flight_ceiling(mut self, in_flight_ceiling: usize) -> Self {
        self.in_flight_ceiling = in_flight_ceiling;
        self
    }

    pub fn with_ordering_required(mut self, ordering_required: bool) -> Self {
        self.ordering_required = ordering_required;
        self
    }

    pub fn with_batching(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Batch settings in effect, if the run is in decoupled mode.
    ///
    /// Ordered runs always use decoupled mode; without explicit settings
    /// they get [`BatchConfig::default`].
    pub fn batching(&self) -> Option<BatchConfig> {
        match (&self.batch, self.ordering_required) {
            (Some(batch), _) => Some(batch.clone()),
            (None, true) => Some(BatchConfig::default()),
            (None, false) => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.admission.validate()?;
        self.retry.validate()?;

        if self.in_flight_ceiling < self.admission.concurrency_cap {
            return Err(FanoutError::Configuration(format!(
                "in_flight_ceiling ({}) must be >= concurrency_cap ({})",
                self.in_flight_ceiling, self.admission.concurrency_cap
            )));
        }
        if self.in_flight_ceiling > Semaphore::MAX_PERMITS {
            return Err(FanoutError::Configuration(format!(
                "in_flight_ceiling must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if let Some(batch) = &self.batch {
            batch.validate()?;
        }
        if let Some(deadline) = self.deadline {
            if deadline.is_zero() {
                return Err(FanoutError::configuration(
                    "deadline must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

//! Admission control.
//!
//! Before every invocation attempt a task must hold an [`AdmissionToken`]:
//! one concurrency slot plus one token taken from the rate bucket. The
//! [`AdmissionLimiter`] trait is the seam for where that state lives; the
//! engine only ever talks to the trait, so a limiter backed by an external
//! coordination service can replace [`LocalAdmissionLimiter`] for
//! account-wide limits shared by several processes.
//!
//! # Guarantees
//!
//! - Tokens in use never exceed the concurrency cap
//! - The rate bucket never holds more than its capacity
//! - A waiting `acquire()` sleeps until the next token is minted and never
//!   spins
//! - Dropping a pending `acquire()` future gives back any slot it reserved

use async_trait::async_trait;
use fanout_common::config::AdmissionConfig;
use fanout_common::rate_limit::TokenBucket;
use fanout_common::{FanoutError, Result};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// Permission to perform one invocation attempt.
///
/// The slot is returned exactly once: by [`release`](Self::release), or by
/// `Drop` if the holder unwinds without releasing.
pub struct AdmissionToken {
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl AdmissionToken {
    /// Creates a token that runs `on_release` when it is given back.
    pub fn new(on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn release(mut self) {
        self.give_back();
    }

    pub fn is_released(&self) -> bool {
        self.on_release.is_none()
    }

    fn give_back(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionToken")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Grants admission tokens under a concurrency cap and a rate limit.
#[async_trait]
pub trait AdmissionLimiter: Send + Sync {
    /// Waits until a concurrency slot and a rate token are both available.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`] immediately when the limiter
    /// can never grant a token, and [`FanoutError::LimiterClosed`] if the
    /// limiter shut down while waiting.
    async fn acquire(&self) -> Result<AdmissionToken>;

    /// Returns a token's concurrency slot.
    fn release(&self, token: AdmissionToken) {
        token.release();
    }

    /// Tokens currently held.
    fn in_use(&self) -> usize;
}

/// In-process admission limiter for a single node.
///
/// A task first reserves a concurrency slot from a semaphore, then takes a
/// token from the bucket, sleeping for exactly the refill time whenever the
/// bucket is empty. Slots are handed out in FIFO order, and since only slot
/// holders compete for the bucket, at most `concurrency_cap` tasks ever wait
/// on it.
///
/// # Example
///
/// ```
/// use fanout_common::config::AdmissionConfig;
/// use fanout_engine::admission::{AdmissionLimiter, LocalAdmissionLimiter};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let limiter = LocalAdmissionLimiter::new(AdmissionConfig::per_second(2, 10, 5));
///
/// let token = limiter.acquire().await.unwrap();
/// assert_eq!(limiter.in_use(), 1);
/// limiter.release(token);
/// assert_eq!(limiter.in_use(), 0);
/// # });
/// ```
pub struct LocalAdmissionLimiter {
    config: AdmissionConfig,
    /// Set when the configuration can never grant a token
    misconfigured: Option<String>,
    slots: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
    in_use: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl LocalAdmissionLimiter {
    pub fn new(config: AdmissionConfig) -> Self {
        let misconfigured = config.validate().err().map(|e| e.to_string());
        let permits = config.concurrency_cap.min(Semaphore::MAX_PERMITS);
        let bucket = TokenBucket::new(
            config.bucket_capacity,
            config.refill_per_second(),
            Instant::now(),
        );

        Self {
            config,
            misconfigured,
            slots: Arc::new(Semaphore::new(permits)),
            bucket: Mutex::new(bucket),
            in_use: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Highest number of tokens held at once since creation.
    pub fn peak_in_use(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Tokens in the bucket as of its last refill.
    pub async fn available_tokens(&self) -> f64 {
        self.bucket.lock().await.available()
    }

    /// Stops granting tokens; pending and future acquires fail.
    pub fn close(&self) {
        self.slots.close();
    }

    async fn take_rate_token(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_consume(Instant::now()) {
                    return;
                }
                bucket.time_until_next_token()
            };
            tracing::trace!("Rate bucket empty, waiting {:?} for next token", wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl AdmissionLimiter for LocalAdmissionLimiter {
    async fn acquire(&self) -> Result<AdmissionToken> {
        if let Some(reason) = &self.misconfigured {
            return Err(FanoutError::Configuration(reason.clone()));
        }

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| FanoutError::LimiterClosed)?;

        // The permit is released if this future is dropped while waiting
        self.take_rate_token().await;

        let held = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(held, Ordering::SeqCst);

        let in_use = Arc::clone(&self.in_use);
        Ok(AdmissionToken::new(move || {
            in_use.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        }))
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

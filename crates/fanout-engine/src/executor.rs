//! Invocation executor.
//!
//! Drives one record from its first attempt to its terminal outcome:
//! acquire admission, invoke, release, and on a retryable failure sleep for
//! the policy's delay before competing for admission again. The admission
//! token is never held across a backoff sleep.
//!
//! Every suspension point (admission, the call itself, the backoff sleep)
//! races against the run's cancellation token, so an abort unwinds a record
//! promptly and releases whatever it holds.

use crate::admission::{AdmissionLimiter, AdmissionToken};
use crate::retry::{RetryDecision, RetryPolicy};
use fanout_common::{
    AttemptOutcome, FailureClass, FanoutError, InvocationAttempt, InvocationError, InvokeResult,
    Record, TerminalOutcome, Transport,
};
use fanout_metrics::OutcomeAggregator;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

enum Next {
    Retry,
    Done(TerminalOutcome),
}

/// Executes records against a transport under admission control and a
/// retry policy, reporting one metric event per attempt.
pub struct InvocationExecutor {
    transport: Arc<dyn Transport>,
    limiter: Arc<dyn AdmissionLimiter>,
    policy: RetryPolicy,
    aggregator: Arc<OutcomeAggregator>,
    cancel: CancellationToken,
}

impl InvocationExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<dyn AdmissionLimiter>,
        policy: RetryPolicy,
        aggregator: Arc<OutcomeAggregator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            limiter,
            policy,
            aggregator,
            cancel,
        }
    }

    /// Runs `record` through as many attempts as the policy allows.
    pub async fn execute(&self, record: &Record) -> TerminalOutcome {
        self.run_from(record, 1).await
    }

    /// Continues a record whose attempt number `attempt` already failed
    /// elsewhere (a batch delivery), applying the policy to that failure.
    pub async fn resume(
        &self,
        record: &Record,
        attempt: u32,
        failure: InvocationError,
    ) -> TerminalOutcome {
        match self.after_failure(record, attempt, failure).await {
            Next::Retry => self.run_from(record, attempt + 1).await,
            Next::Done(outcome) => outcome,
        }
    }

    /// Performs one call and records its metric event. The caller holds
    /// admission.
    pub async fn attempt(&self, record: &Record, attempt: u32) -> InvokeResult {
        let started_at = Instant::now();
        let result = self.transport.invoke(record).await;

        let invocation = InvocationAttempt {
            attempt,
            started_at,
            latency: started_at.elapsed(),
            outcome: AttemptOutcome::of(&result),
        };
        self.aggregator.record_attempt(&invocation);

        match &result {
            Ok(_) => tracing::debug!(
                record_id = %record.id,
                attempt,
                latency_us = invocation.latency.as_micros() as u64,
                "Invocation succeeded"
            ),
            Err(e) => tracing::debug!(
                record_id = %record.id,
                attempt,
                class = %e.class,
                "Invocation failed: {}",
                e.message
            ),
        }
        result
    }

    /// Delivers `records` as one invocation under a single admission token.
    ///
    /// Returns one result per record in input order, or the outcome every
    /// record in the batch ends with if the delivery never completed.
    pub async fn attempt_batch(
        &self,
        records: &[Record],
    ) -> Result<Vec<InvokeResult>, TerminalOutcome> {
        let token = self.admit(0).await?;

        let started_at = Instant::now();
        let results = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.limiter.release(token);
                return Err(TerminalOutcome::Cancelled { attempts: 1 });
            }
            results = self.transport.invoke_batch(records) => results,
        };
        self.limiter.release(token);
        let latency = started_at.elapsed();

        let mut results = results;
        if results.len() != records.len() {
            tracing::warn!(
                "Transport returned {} results for a batch of {}",
                results.len(),
                records.len()
            );
            results.truncate(records.len());
            results.resize_with(records.len(), || {
                Err(InvocationError::transient("no result returned for batch member"))
            });
        }

        for result in &results {
            self.aggregator.record_attempt(&InvocationAttempt {
                attempt: 1,
                started_at,
                latency,
                outcome: AttemptOutcome::of(result),
            });
        }
        tracing::debug!(
            batch_size = records.len(),
            failed = results.iter().filter(|r| r.is_err()).count(),
            "Batch delivered"
        );

        Ok(results)
    }

    async fn run_from(&self, record: &Record, mut attempt: u32) -> TerminalOutcome {
        loop {
            let token = match self.admit(attempt - 1).await {
                Ok(token) => token,
                Err(outcome) => return outcome,
            };

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.limiter.release(token);
                    return TerminalOutcome::Cancelled { attempts: attempt };
                }
                result = self.attempt(record, attempt) => result,
            };
            self.limiter.release(token);

            let failure = match result {
                Ok(_) => return TerminalOutcome::Succeeded { attempts: attempt },
                Err(failure) => failure,
            };

            match self.after_failure(record, attempt, failure).await {
                Next::Retry => attempt += 1,
                Next::Done(outcome) => return outcome,
            }
        }
    }

    /// Waits for admission; `attempts_made` is reported if waiting ends the
    /// record instead.
    async fn admit(&self, attempts_made: u32) -> Result<AdmissionToken, TerminalOutcome> {
        let acquired = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(TerminalOutcome::Cancelled { attempts: attempts_made });
            }
            acquired = self.limiter.acquire() => acquired,
        };

        match acquired {
            Ok(token) => Ok(token),
            Err(FanoutError::Cancelled) => Err(TerminalOutcome::Cancelled {
                attempts: attempts_made,
            }),
            Err(e) => {
                tracing::error!("Admission failed: {}", e);
                Err(TerminalOutcome::Fatal {
                    attempts: attempts_made,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn after_failure(&self, record: &Record, attempt: u32, failure: InvocationError) -> Next {
        match self.policy.decide(attempt, &failure) {
            RetryDecision::GiveUp if failure.class == FailureClass::Fatal => {
                Next::Done(TerminalOutcome::Fatal {
                    attempts: attempt,
                    reason: failure.message,
                })
            }
            RetryDecision::GiveUp => {
                tracing::warn!(
                    record_id = %record.id,
                    "Giving up after {} attempts: {}",
                    attempt,
                    failure
                );
                Next::Done(TerminalOutcome::Exhausted {
                    attempts: attempt,
                    last_failure: failure.class,
                    reason: failure.message,
                })
            }
            RetryDecision::Retry(delay) => {
                tracing::debug!(
                    record_id = %record.id,
                    "Attempt {} {}, retrying in {}ms",
                    attempt,
                    failure.class,
                    delay.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        Next::Done(TerminalOutcome::Cancelled { attempts: attempt })
                    }
                    _ = tokio::time::sleep(delay) => Next::Retry,
                }
            }
        }
    }
}

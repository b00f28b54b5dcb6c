// Copyright 2026 Fanout Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::histogram::LatencyHistogram;
use crate::summary::{OutcomeSummary, Progress, RecordOutcome};
use fanout_common::{
    AttemptOutcome, FailureClass, InvocationAttempt, Record, RecordId, TerminalOutcome,
};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

/// Accumulates per-attempt metrics and per-record terminal outcomes.
///
/// Counters are atomics, so `report` and `record_attempt` can be called from
/// every in-flight task without contention. Per-record outcomes are only kept
/// when retention is enabled.
///
/// # Example
///
/// ```
/// use fanout_metrics::OutcomeAggregator;
/// use fanout_common::{Record, TerminalOutcome};
/// use std::sync::Arc;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let aggregator = Arc::new(OutcomeAggregator::new());
/// let record = Record::anonymous(0, "payload");
///
/// let pending = aggregator.admit(&record);
/// pending.settle(TerminalOutcome::Succeeded { attempts: 1 });
///
/// let summary = aggregator.finalize();
/// assert_eq!(summary.total, 1);
/// assert_eq!(summary.succeeded, 1);
/// # });
/// ```
#[derive(Debug)]
pub struct OutcomeAggregator {
    started: Instant,
    admitted: AtomicU64,

    succeeded: AtomicU64,
    fatal: AtomicU64,
    rejected: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
    retried: AtomicU64,
    retries: AtomicU64,

    attempts: AtomicU64,
    throttled_attempts: AtomicU64,
    transient_attempts: AtomicU64,
    fatal_attempts: AtomicU64,
    latencies: LatencyHistogram,

    run_cancelled: AtomicBool,
    source_error: Mutex<Option<String>>,
    records: Option<Mutex<Vec<RecordOutcome>>>,
}

impl OutcomeAggregator {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Aggregator that also keeps every record's outcome for the summary.
    pub fn with_record_retention() -> Self {
        Self::build(true)
    }

    fn build(retain_records: bool) -> Self {
        Self {
            started: Instant::now(),
            admitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            fatal: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            throttled_attempts: AtomicU64::new(0),
            transient_attempts: AtomicU64::new(0),
            fatal_attempts: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            run_cancelled: AtomicBool::new(false),
            source_error: Mutex::new(None),
            records: retain_records.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Registers a record pulled from the source.
    ///
    /// The returned guard must be settled with the record's terminal outcome;
    /// a guard dropped unsettled reports the record as cancelled.
    pub fn admit(self: &Arc<Self>, record: &Record) -> PendingOutcome {
        self.admit_id(record.id.clone(), record.sequence)
    }

    pub fn admit_id(self: &Arc<Self>, id: RecordId, sequence: u64) -> PendingOutcome {
        self.admitted.fetch_add(1, Ordering::Relaxed);
        PendingOutcome {
            aggregator: Arc::clone(self),
            id,
            sequence,
            settled: false,
        }
    }

    /// Records one attempt's latency and outcome.
    pub fn record_attempt(&self, attempt: &InvocationAttempt) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.latencies.record(attempt.latency);

        match attempt.outcome {
            AttemptOutcome::Success => {}
            AttemptOutcome::Failed(FailureClass::Throttled) => {
                self.throttled_attempts.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Failed(FailureClass::Transient) => {
                self.transient_attempts.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Failed(FailureClass::Fatal) => {
                self.fatal_attempts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Records a terminal outcome. Call exactly once per record; prefer
    /// [`PendingOutcome::settle`], which enforces that.
    pub fn report(&self, id: &RecordId, sequence: u64, outcome: TerminalOutcome) {
        let counter = match &outcome {
            TerminalOutcome::Succeeded { .. } => &self.succeeded,
            TerminalOutcome::Fatal { .. } => &self.fatal,
            TerminalOutcome::Rejected { .. } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                &self.fatal
            }
            TerminalOutcome::Exhausted { .. } => &self.exhausted,
            TerminalOutcome::Cancelled { .. } => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let attempts = u64::from(outcome.attempts());
        if attempts > 1 {
            self.retried.fetch_add(1, Ordering::Relaxed);
            self.retries.fetch_add(attempts - 1, Ordering::Relaxed);
        }

        if let Some(records) = &self.records {
            records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RecordOutcome {
                    id: id.clone(),
                    sequence,
                    outcome,
                });
        }
    }

    /// Flags the run as aborted.
    pub fn mark_cancelled(&self) {
        self.run_cancelled.store(true, Ordering::Relaxed);
    }

    /// Notes why the source stopped early.
    pub fn set_source_error(&self, error: impl Into<String>) {
        *self
            .source_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    fn settled(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
            + self.fatal.load(Ordering::Relaxed)
            + self.exhausted.load(Ordering::Relaxed)
            + self.cancelled.load(Ordering::Relaxed)
    }

    /// Point-in-time counters for progress reporting.
    pub fn progress(&self) -> Progress {
        let admitted = self.admitted.load(Ordering::Relaxed);
        let settled = self.settled();
        Progress {
            admitted,
            in_flight: admitted.saturating_sub(settled),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.fatal.load(Ordering::Relaxed) + self.exhausted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Builds the summary.
    ///
    /// Call once every task that reports into this aggregator has finished;
    /// all of their reports are visible to the returned summary.
    pub fn finalize(&self) -> OutcomeSummary {
        fence(Ordering::SeqCst);

        let admitted = self.admitted.load(Ordering::Relaxed);
        let settled = self.settled();
        if admitted != settled {
            tracing::warn!(
                "Finalizing with {} admitted records but {} terminal outcomes",
                admitted,
                settled
            );
        }

        let fatal = self.fatal.load(Ordering::Relaxed);
        let exhausted = self.exhausted.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);

        let records = match &self.records {
            Some(records) => {
                let mut records = records
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                records.sort_by_key(|r| r.sequence);
                records
            }
            None => Vec::new(),
        };

        OutcomeSummary {
            total: succeeded + fatal + exhausted + cancelled,
            succeeded,
            failed: fatal + exhausted,
            fatal,
            rejected: self.rejected.load(Ordering::Relaxed),
            exhausted,
            cancelled,
            retried: self.retried.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            throttled_attempts: self.throttled_attempts.load(Ordering::Relaxed),
            transient_attempts: self.transient_attempts.load(Ordering::Relaxed),
            fatal_attempts: self.fatal_attempts.load(Ordering::Relaxed),
            latency: self.latencies.distribution(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            run_cancelled: self.run_cancelled.load(Ordering::Relaxed),
            source_error: self
                .source_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            records,
        }
    }
}

impl Default for OutcomeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// An admitted record that has not reached its terminal outcome yet.
///
/// Settling consumes the guard, so a record cannot be reported twice.
/// Dropping it unsettled (an aborted task, a record still sitting in a
/// buffer at cancellation) reports the record as cancelled.
#[derive(Debug)]
pub struct PendingOutcome {
    aggregator: Arc<OutcomeAggregator>,
    id: RecordId,
    sequence: u64,
    settled: bool,
}

impl PendingOutcome {
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn settle(mut self, outcome: TerminalOutcome) {
        self.settled = true;
        self.aggregator.report(&self.id, self.sequence, outcome);
    }
}

impl Drop for PendingOutcome {
    fn drop(&mut self) {
        if !self.settled {
            self.aggregator.report(
                &self.id,
                self.sequence,
                TerminalOutcome::Cancelled { attempts: 0 },
            );
        }
    }
}

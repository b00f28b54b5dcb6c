//! Dispatch loop and engine entry point.
//!
//! [`Engine::run`] drains a [`RecordSource`] and returns an
//! [`OutcomeSummary`]. Two modes share the same admission, retry and
//! accounting machinery:
//!
//! - **Direct**: one task per record, each acquiring admission and
//!   retrying on its own.
//! - **Decoupled**: records go through a bounded [`PartitionedBuffer`] and
//!   are delivered in batches by one consumer per lane. Selected by
//!   configuring batching or requiring ordering.
//!
//! In both modes the loop takes an in-flight slot *before* pulling the next
//! record, so at most `in_flight_ceiling` records are ever running, backing
//! off, waiting for admission or sitting in the buffer. A fast source
//! simply waits.
//!
//! # Cancellation
//!
//! Cancelling the engine's token (or hitting the configured deadline)
//! stops the loop from pulling further records and unwinds every suspended
//! task. Records already pulled end as `Cancelled` unless they completed
//! first; the summary still accounts for each of them exactly once.

use crate::admission::{AdmissionLimiter, LocalAdmissionLimiter};
use crate::batch::{log_join_error, BatchConsumer, Dispatched};
use crate::buffer::{DeliveryOrder, PartitionedBuffer};
use crate::executor::InvocationExecutor;
use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;
use fanout_common::{
    BatchConfig, DispatchConfig, Record, RecordSource, Result, SourceError, TerminalOutcome,
    Transport,
};
use fanout_metrics::{OutcomeAggregator, OutcomeSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancels a run when its time budget runs out. Disarmed when dropped.
struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl DeadlineGuard {
    fn arm(deadline: Duration, cancel: CancellationToken) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!("Deadline of {}ms reached, cancelling run", deadline.as_millis());
            cancel.cancel();
        });
        Self { handle }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The record-dispatch engine.
///
/// # Example
///
/// ```no_run
/// use fanout_common::{AdmissionConfig, DispatchConfig, HttpTransport, VecSource};
/// use fanout_engine::Engine;
/// use std::sync::Arc;
///
/// # async fn run() -> fanout_common::Result<()> {
/// let config = DispatchConfig::new(AdmissionConfig::per_minute(50, 1000, 500));
/// let transport = Arc::new(HttpTransport::new("http://127.0.0.1:8080/ingest")?);
/// let engine = Engine::new(config, transport)?;
///
/// let summary = engine.run(VecSource::from_payloads(vec!["{}", "{}"])).await;
/// println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    config: DispatchConfig,
    transport: Arc<dyn Transport>,
    limiter: Arc<dyn AdmissionLimiter>,
    cancel: CancellationToken,
    retain_records: bool,
    progress_interval: Option<Duration>,
}

impl Engine {
    /// Creates an engine with an in-process admission limiter.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Configuration`](fanout_common::FanoutError::Configuration)
    /// if the configuration is invalid.
    pub fn new(config: DispatchConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(LocalAdmissionLimiter::new(config.admission.clone()));

        Ok(Self {
            config,
            transport,
            limiter,
            cancel: CancellationToken::new(),
            retain_records: false,
            progress_interval: None,
        })
    }

    /// Replaces the admission limiter, e.g. with one backed by a shared
    /// coordination service.
    pub fn with_limiter(mut self, limiter: Arc<dyn AdmissionLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Uses `cancel` as the abort signal for every run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Lists every record's outcome in the summary.
    pub fn with_record_retention(mut self, retain: bool) -> Self {
        self.retain_records = retain;
        self
    }

    /// Logs progress at the given interval while running.
    pub fn with_progress_interval(mut self, every: Duration) -> Self {
        self.progress_interval = Some(every);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Token that aborts runs of this engine when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drains `source` and returns the summary.
    ///
    /// Per-record failures never abort the run; they are counted in the
    /// summary. The run ends early only on cancellation, deadline expiry or
    /// a source read error.
    pub async fn run<S: RecordSource>(&self, mut source: S) -> OutcomeSummary {
        let cancel = self.cancel.child_token();
        let aggregator = Arc::new(if self.retain_records {
            OutcomeAggregator::with_record_retention()
        } else {
            OutcomeAggregator::new()
        });
        let executor = Arc::new(InvocationExecutor::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.limiter),
            RetryPolicy::new(self.config.retry.clone()),
            Arc::clone(&aggregator),
            cancel.clone(),
        ));

        let deadline = self
            .config
            .deadline
            .map(|deadline| DeadlineGuard::arm(deadline, cancel.clone()));
        let progress = self
            .progress_interval
            .map(|every| ProgressReporter::start(Arc::clone(&aggregator), every));

        let feeder = Feeder {
            ceiling: Arc::new(Semaphore::new(self.config.in_flight_ceiling)),
            aggregator: Arc::clone(&aggregator),
            cancel: cancel.clone(),
        };

        match self.config.batching() {
            None => {
                info!(
                    "Dispatching directly: concurrency cap {}, in-flight ceiling {}",
                    self.config.admission.concurrency_cap, self.config.in_flight_ceiling
                );
                dispatch_direct(&mut source, &feeder, executor).await;
            }
            Some(batch) => {
                info!(
                    "Dispatching through buffer: batch size {}, poll interval {}ms, ordered {}",
                    batch.batch_size,
                    batch.poll_interval.as_millis(),
                    self.config.ordering_required
                );
                let order = if self.config.ordering_required {
                    DeliveryOrder::Fifo
                } else {
                    DeliveryOrder::Unordered
                };
                dispatch_decoupled(&mut source, &feeder, executor, &batch, order).await;
            }
        }

        drop(progress);
        drop(deadline);
        if cancel.is_cancelled() {
            aggregator.mark_cancelled();
        }

        let summary = aggregator.finalize();
        info!(
            "Run finished in {}ms: {} succeeded, {} failed, {} cancelled ({} attempts)",
            summary.elapsed_ms, summary.succeeded, summary.failed, summary.cancelled, summary.attempts
        );
        summary
    }
}

/// Pulls records from the source under the in-flight ceiling.
struct Feeder {
    ceiling: Arc<Semaphore>,
    aggregator: Arc<OutcomeAggregator>,
    cancel: CancellationToken,
}

impl Feeder {
    /// Next dispatchable record with its in-flight slot, or `None` when the
    /// source is exhausted, failed, or the run was cancelled.
    ///
    /// Malformed records are settled as rejected here and never reach the
    /// transport.
    async fn next<S: RecordSource>(&self, source: &mut S) -> Option<(Record, OwnedSemaphorePermit)> {
        loop {
            let slot = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                slot = Arc::clone(&self.ceiling).acquire_owned() => slot.ok()?,
            };

            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                item = source.next() => item,
            };

            match item? {
                Ok(record) => return Some((record, slot)),
                Err(SourceError::Malformed {
                    id,
                    sequence,
                    reason,
                }) => {
                    warn!("Rejecting malformed record {} (sequence {}): {}", id, sequence, reason);
                    self.aggregator
                        .admit_id(id, sequence)
                        .settle(TerminalOutcome::Rejected { reason });
                }
                Err(SourceError::Io(e)) => {
                    error!("Source read failed, no further records will be dispatched: {}", e);
                    self.aggregator.set_source_error(e.to_string());
                    return None;
                }
            }
        }
    }
}

async fn dispatch_direct<S: RecordSource>(
    source: &mut S,
    feeder: &Feeder,
    executor: Arc<InvocationExecutor>,
) {
    let mut tasks = JoinSet::new();

    while let Some((record, slot)) = feeder.next(source).await {
        let pending = feeder.aggregator.admit(&record);
        let executor = Arc::clone(&executor);
        tasks.spawn(async move {
            let outcome = executor.execute(&record).await;
            pending.settle(outcome);
            drop(slot);
        });

        while let Some(joined) = tasks.try_join_next() {
            log_join_error(joined);
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_join_error(joined);
    }
}

async fn dispatch_decoupled<S: RecordSource>(
    source: &mut S,
    feeder: &Feeder,
    executor: Arc<InvocationExecutor>,
    config: &BatchConfig,
    order: DeliveryOrder,
) {
    let buffer = PartitionedBuffer::new(config.buffer_capacity, config.partitions, order);

    let mut consumers = JoinSet::new();
    for (lane, queue) in buffer.lanes().iter().enumerate() {
        let consumer = BatchConsumer::new(
            lane,
            Arc::clone(queue),
            Arc::clone(&executor),
            config,
            order,
            feeder.cancel.clone(),
        );
        consumers.spawn(consumer.run());
    }

    while let Some((record, slot)) = feeder.next(source).await {
        let pending = feeder.aggregator.admit(&record);
        let item = Dispatched::new(record, pending, slot);

        // A dropped item reports itself as cancelled
        let enqueued = tokio::select! {
            biased;
            _ = feeder.cancel.cancelled() => break,
            enqueued = buffer.enqueue(item) => enqueued,
        };
        if enqueued.is_err() {
            warn!("Buffer closed while the source still had records");
            break;
        }
    }

    buffer.close();
    while let Some(joined) = consumers.join_next().await {
        log_join_error(joined);
    }
    // Records still queued after a cancellation are reported as cancelled here
    drop(buffer);
}

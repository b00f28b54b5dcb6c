//! Batch consumer for decoupled dispatch.
//!
//! Each consumer drains one buffer lane. A batch is delivered as one
//! invocation under one admission token; afterwards every member is judged
//! on its own result, so one failed record never holds back the success of
//! its batch-mates. Failed members continue through the normal retry path,
//! each competing for admission like any other record.
//!
//! On a FIFO lane a batch's retries finish before the next batch is
//! dequeued, which keeps delivery in source order. On unordered lanes the
//! retries run as separate tasks and the consumer moves on.

use crate::buffer::{BatchQueue, DeliveryOrder};
use crate::executor::InvocationExecutor;
use fanout_common::{BatchConfig, InvocationError, Record, TerminalOutcome};
use fanout_metrics::PendingOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// A record travelling through the buffer, together with its pending
/// outcome and its in-flight slot.
///
/// Dropping it before it is settled reports the record as cancelled.
pub(crate) struct Dispatched {
    pub(crate) record: Record,
    pending: PendingOutcome,
    _slot: OwnedSemaphorePermit,
}

impl Dispatched {
    pub(crate) fn new(record: Record, pending: PendingOutcome, slot: OwnedSemaphorePermit) -> Self {
        Self {
            record,
            pending,
            _slot: slot,
        }
    }

    pub(crate) fn settle(self, outcome: TerminalOutcome) {
        self.pending.settle(outcome);
    }
}

pub(crate) fn log_join_error(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!("Dispatch task panicked: {}", e);
        }
    }
}

pub(crate) struct BatchConsumer<Q> {
    lane: usize,
    queue: Arc<Q>,
    executor: Arc<InvocationExecutor>,
    batch_size: usize,
    poll_interval: Duration,
    order: DeliveryOrder,
    cancel: CancellationToken,
}

impl<Q: BatchQueue<Dispatched> + 'static> BatchConsumer<Q> {
    pub(crate) fn new(
        lane: usize,
        queue: Arc<Q>,
        executor: Arc<InvocationExecutor>,
        config: &BatchConfig,
        order: DeliveryOrder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lane,
            queue,
            executor,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            order,
            cancel,
        }
    }

    /// Consumes until the lane is closed and drained, or the run is
    /// cancelled. Items left in the lane on cancellation are reported as
    /// cancelled when the buffer is dropped.
    pub(crate) async fn run(self) {
        let mut retries = JoinSet::new();
        let mut batches = 0u64;

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                batch = self.queue.dequeue_batch(self.batch_size, self.poll_interval) => batch,
            };
            let Some(batch) = batch else {
                break;
            };

            while let Some(joined) = retries.try_join_next() {
                log_join_error(joined);
            }
            if batch.is_empty() {
                continue;
            }

            batches += 1;
            self.deliver(batch, &mut retries).await;
        }

        while let Some(joined) = retries.join_next().await {
            log_join_error(joined);
        }
        tracing::debug!("Lane {} consumer finished after {} batches", self.lane, batches);
    }

    async fn deliver(&self, batch: Vec<Dispatched>, retries: &mut JoinSet<()>) {
        let records: Vec<Record> = batch.iter().map(|item| item.record.clone()).collect();

        let results = match self.executor.attempt_batch(&records).await {
            Ok(results) => results,
            Err(outcome) => {
                for item in batch {
                    item.settle(outcome.clone());
                }
                return;
            }
        };

        let mut failed: Vec<(Dispatched, InvocationError)> = Vec::new();
        for (item, result) in batch.into_iter().zip(results) {
            match result {
                Ok(_) => item.settle(TerminalOutcome::Succeeded { attempts: 1 }),
                Err(failure) => failed.push((item, failure)),
            }
        }

        match self.order {
            DeliveryOrder::Fifo => {
                for (item, failure) in failed {
                    let outcome = self.executor.resume(&item.record, 1, failure).await;
                    item.settle(outcome);
                }
            }
            DeliveryOrder::Unordered => {
                for (item, failure) in failed {
                    let executor = Arc::clone(&self.executor);
                    retries.spawn(async move {
                        let outcome = executor.resume(&item.record, 1, failure).await;
                        item.settle(outcome);
                    });
                }
            }
        }
    }
}

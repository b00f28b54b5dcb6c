use fanout_metrics::OutcomeAggregator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Periodically logs run progress. Stops when dropped.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn start(aggregator: Arc<OutcomeAggregator>, every: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let progress = aggregator.progress();
                tracing::info!(
                    admitted = progress.admitted,
                    in_flight = progress.in_flight,
                    succeeded = progress.succeeded,
                    failed = progress.failed,
                    cancelled = progress.cancelled,
                    attempts = progress.attempts,
                    "Progress after {}ms",
                    progress.elapsed_ms
                );
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

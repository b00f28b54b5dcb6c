//! Fanout Outcome Metrics
//!
//! This crate accumulates what happened during a dispatch run: one terminal
//! outcome per record, one metric event per invocation attempt, and a
//! latency histogram over all attempts.
//!
//! # Architecture
//!
//! - [`OutcomeAggregator`]: lock-free counters fed by every in-flight task
//! - [`PendingOutcome`]: guard handed out on admission; settling it is the
//!   only way a record reaches a terminal outcome, and dropping it unsettled
//!   reports the record as cancelled
//! - [`LatencyHistogram`]: log-linear histogram for percentile estimates
//! - [`OutcomeSummary`]: serializable result returned to the caller
//!
//! # Thread Safety
//!
//! The aggregator is shared as `Arc<OutcomeAggregator>`. Counters and the
//! histogram use relaxed atomics on the hot path; the optional per-record
//! list sits behind a mutex. `finalize` is a read barrier and is meant to be
//! called after every reporting task has been joined.

mod aggregator;
mod histogram;
mod summary;

pub use aggregator::{OutcomeAggregator, PendingOutcome};
pub use histogram::LatencyHistogram;
pub use summary::{LatencyDistribution, OutcomeSummary, Progress, RecordOutcome};

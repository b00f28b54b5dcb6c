//! # Fanout
//!
//! Bounded-concurrency, rate-limited record dispatch.
//!
//! This package re-exports the workspace crates under one name:
//!
//! - [`common`]: records, outcomes, configuration, sources and transports
//! - [`metrics`]: outcome aggregation and run summaries
//! - [`engine`]: admission control, retries and the dispatch loops

pub use fanout_common as common;
pub use fanout_engine as engine;
pub use fanout_metrics as metrics;

pub use fanout_common::{
    AdmissionConfig, BatchConfig, DispatchConfig, FailureClass, FanoutError, InvocationError,
    InvokeResult, JsonLinesSource, Record, RecordId, RecordSource, RetryConfig, SourceError,
    TerminalOutcome, Transport, VecSource,
};
pub use fanout_engine::{CancellationToken, Engine};
pub use fanout_metrics::{OutcomeSummary, RecordOutcome};

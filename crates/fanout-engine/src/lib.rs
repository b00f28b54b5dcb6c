//! Fanout Dispatch Engine
//!
//! Takes records from a [`RecordSource`](fanout_common::RecordSource) and
//! delivers each one to a [`Transport`](fanout_common::Transport) under two
//! independent limits: a cap on concurrent invocations and a token-bucket
//! rate limit. Failed invocations are classified and retried with
//! exponential backoff; every record ends in exactly one terminal outcome,
//! collected into an [`OutcomeSummary`](fanout_metrics::OutcomeSummary).
//!
//! # Architecture
//!
//! - [`Engine`]: entry point; pulls records and picks the dispatch mode
//! - [`LocalAdmissionLimiter`]: concurrency slots plus a rate bucket behind
//!   the [`AdmissionLimiter`] trait
//! - [`RetryPolicy`]: backoff and give-up decisions per failure class
//! - [`InvocationExecutor`]: one record from first attempt to terminal
//!   outcome
//! - [`PartitionedBuffer`]: bounded backpressure buffer for batched,
//!   optionally ordered delivery
//! - [`ProgressReporter`]: periodic progress logging
//!
//! # Example
//!
//! ```no_run
//! use fanout_common::{AdmissionConfig, DispatchConfig, JsonLinesSource, HttpTransport};
//! use fanout_engine::Engine;
//! use std::sync::Arc;
//!
//! # async fn run() -> fanout_common::Result<()> {
//! let config = DispatchConfig::new(AdmissionConfig::per_minute(50, 1000, 500));
//! let engine = Engine::new(config, Arc::new(HttpTransport::new("http://localhost:9000/")?))?;
//!
//! let summary = engine.run(JsonLinesSource::open("records.jsonl").await?).await;
//! assert!(summary.is_balanced());
//! # Ok(())
//! # }
//! ```

pub mod admission;
mod batch;
pub mod buffer;
pub mod dispatch;
pub mod executor;
pub mod progress;
pub mod retry;

pub use admission::{AdmissionLimiter, AdmissionToken, LocalAdmissionLimiter};
pub use buffer::{BatchQueue, BoundedBuffer, DeliveryOrder, PartitionedBuffer};
pub use dispatch::Engine;
pub use executor::InvocationExecutor;
pub use progress::ProgressReporter;
pub use retry::{RetryDecision, RetryPolicy};
pub use tokio_util::sync::CancellationToken;

//! Fanout Common Types
//!
//! Shared building blocks for the fanout record-dispatch engine: the record
//! model, outcome classification, configuration, the token bucket, record
//! sources and delivery transports.
//!
//! # Components
//!
//! - [`record`] - records and their idempotency ids
//! - [`outcome`] - failure classes, attempts and terminal outcomes
//! - [`config`] - admission, retry, batching and run configuration
//! - [`rate_limit`] - continuous-refill token bucket
//! - [`source`] - lazy record sources (in-memory, JSON Lines)
//! - [`transport`] - delivery trait and the HTTP transport
//!
//! # Example
//!
//! ```
//! use fanout_common::{InvocationError, FailureClass, Record};
//!
//! let record = Record::new("order-1", 0, r#"{"sku": "A-1"}"#);
//! let failure = InvocationError::transient("connection reset");
//! assert_eq!(failure.class, FailureClass::Transient);
//! assert!(failure.class.is_retryable());
//! ```

pub mod config;
pub mod error;
pub mod outcome;
pub mod rate_limit;
pub mod record;
pub mod source;
pub mod transport;

pub use config::{AdmissionConfig, BatchConfig, DispatchConfig, RetryConfig};
pub use error::{FanoutError, Result};
pub use outcome::{
    AttemptOutcome, FailureClass, InvocationAttempt, InvocationError, InvokeResult,
    TerminalOutcome,
};
pub use record::{Record, RecordId};
pub use source::{JsonLinesSource, RecordSource, SourceError, SourceItem, VecSource};
pub use transport::{HttpTransport, Transport};

//! Transports deliver records to the remote endpoint.
//!
//! The engine never looks at transport-specific status codes: a transport
//! returns the response body on success or an [`InvocationError`] carrying
//! one of three failure classes.
//!
//! # Components
//!
//! - **[`Transport`]**: the delivery trait used by the engine
//! - **[`HttpTransport`]**: POSTs each record to an HTTP endpoint

pub mod http;

pub use http::{classify_status, HttpTransport, IDEMPOTENCY_KEY};

use crate::outcome::InvokeResult;
use crate::record::Record;
use async_trait::async_trait;

/// Delivers records to a remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one record.
    async fn invoke(&self, record: &Record) -> InvokeResult;

    /// Delivers a batch as one logical invocation.
    ///
    /// Returns one result per record, in input order, so that every record
    /// in the batch is classified on its own. The default delivers the
    /// records one after another.
    async fn invoke_batch(&self, records: &[Record]) -> Vec<InvokeResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.invoke(record).await);
        }
        results
    }
}

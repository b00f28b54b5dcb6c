//! Records: the immutable unit of work handed from a source to the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique record identifier, used as the idempotency key on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier derived from a record's position when the source has none.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("record-{}", sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single record pulled from a source.
///
/// Records are cheap to clone: the payload is reference counted, so retries
/// and batch submissions never copy payload bytes.
///
/// # Example
///
/// ```
/// use fanout_common::Record;
///
/// let record = Record::new("order-17", 17, r#"{"total": 12}"#);
/// assert_eq!(record.id.as_str(), "order-17");
/// assert_eq!(record.sequence, 17);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Idempotency key
    pub id: RecordId,
    /// Position in the source, starting at zero
    pub sequence: u64,
    /// Opaque payload delivered to the endpoint
    pub payload: Bytes,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            sequence,
            payload: payload.into(),
        }
    }

    /// Creates a record whose id is derived from its sequence number.
    pub fn anonymous(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(RecordId::from_sequence(sequence), sequence, payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

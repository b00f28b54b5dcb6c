//! Record sources.
//!
//! A source is a lazy, finite, read-once sequence of records. The engine only
//! pulls from it sequentially; restarting a source is the caller's business.
//!
//! Two sources ship with the crate:
//!
//! - [`VecSource`] - records already in memory
//! - [`JsonLinesSource`] - one JSON object per line, read lazily
//!
//! A record that cannot be decoded is yielded as [`SourceError::Malformed`]
//! rather than ending the stream, so the engine can account for it.

use crate::error::Result;
use crate::record::{Record, RecordId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// A record the source could not produce.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The record exists but cannot be decoded; the stream continues
    #[error("malformed record {id} (sequence {sequence}): {reason}")]
    Malformed {
        id: RecordId,
        sequence: u64,
        reason: String,
    },

    /// Reading failed; the stream ends
    #[error("source read failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn malformed(sequence: u64, reason: impl Into<String>) -> Self {
        SourceError::Malformed {
            id: RecordId::from_sequence(sequence),
            sequence,
            reason: reason.into(),
        }
    }
}

pub type SourceItem = std::result::Result<Record, SourceError>;

/// Sequential pull access to a finite record stream.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, or `None` at end of stream.
    async fn next(&mut self) -> Option<SourceItem>;

    /// Number of records remaining, when known.
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

/// In-memory source.
///
/// # Example
///
/// ```
/// use fanout_common::source::{RecordSource, VecSource};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let mut source = VecSource::from_payloads(vec!["a", "b"]);
/// let first = source.next().await.unwrap().unwrap();
/// assert_eq!(first.sequence, 0);
/// assert_eq!(&first.payload[..], b"a");
/// # });
/// ```
pub struct VecSource {
    items: std::vec::IntoIter<SourceItem>,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self::with_items(records.into_iter().map(Ok).collect())
    }

    /// Anonymous records numbered from zero.
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        let records = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| Record::anonymous(i as u64, payload))
            .collect();
        Self::new(records)
    }

    /// Source yielding exactly `items`, malformed entries included.
    pub fn with_items(items: Vec<SourceItem>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    async fn next(&mut self) -> Option<SourceItem> {
        self.items.next()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

#[derive(Deserialize)]
struct JsonLine {
    id: Option<String>,
    payload: serde_json::Value,
}

/// JSON Lines source.
///
/// Each non-blank line must be an object with a `payload` field and an
/// optional string `id`. The payload is re-encoded as compact JSON and
/// becomes the record payload; records without an id get one derived from
/// their sequence number. Blank lines are skipped and do not consume a
/// sequence number. Lines are read as raw bytes, so a line that is not
/// valid UTF-8 is a malformed record like any other undecodable line.
pub struct JsonLinesSource<R = BufReader<File>> {
    reader: R,
    line: Vec<u8>,
    sequence: u64,
    finished: bool,
}

impl JsonLinesSource<BufReader<File>> {
    /// Opens a JSON Lines file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            line: Vec::new(),
            sequence: 0,
            finished: false,
        }
    }

    fn parse(&self, line: &[u8]) -> SourceItem {
        let sequence = self.sequence;
        let parsed: JsonLine = serde_json::from_slice(line)
            .map_err(|e| SourceError::malformed(sequence, e.to_string()))?;

        let payload = serde_json::to_vec(&parsed.payload)
            .map_err(|e| SourceError::malformed(sequence, e.to_string()))?;
        let id = match parsed.id {
            Some(id) if !id.is_empty() => RecordId::new(id),
            _ => RecordId::from_sequence(sequence),
        };

        Ok(Record::new(id, sequence, payload))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> RecordSource for JsonLinesSource<R> {
    async fn next(&mut self) -> Option<SourceItem> {
        if self.finished {
            return None;
        }

        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => {
                    tracing::debug!("Reached end of input after {} records", self.sequence);
                    self.finished = true;
                    return None;
                }
                Ok(_) => {
                    let line = trim_line_ending(&self.line);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let item = self.parse(line);
                    self.sequence += 1;
                    return Some(item);
                }
                Err(e) => {
                    tracing::debug!("Read failed after {} records: {}", self.sequence, e);
                    self.finished = true;
                    return Some(Err(SourceError::Io(e)));
                }
            }
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

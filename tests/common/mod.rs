//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use fanout::{InvocationError, InvokeResult, Record, RecordId, RecordSource, Transport};
use fanout::common::SourceItem;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Script = Box<dyn Fn(&Record, u32) -> InvokeResult + Send + Sync>;

/// Transport whose answers come from a script of `(record, attempt)`.
///
/// Tracks peak concurrency, the order calls started in and how many calls
/// have finished.
pub struct ScriptedTransport {
    script: Script,
    latency: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicU64,
    attempts: Mutex<HashMap<RecordId, u32>>,
    started: Mutex<Vec<(u64, u32)>>,
}

impl ScriptedTransport {
    pub fn new(
        latency: Duration,
        script: impl Fn(&Record, u32) -> InvokeResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            latency,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            finished: AtomicU64::new(0),
            attempts: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
        })
    }

    /// Always succeeds.
    pub fn ok(latency: Duration) -> Arc<Self> {
        Self::new(latency, |_, _| Ok(Bytes::new()))
    }

    /// Fails by payload: `fatal`, `throttled` and `transient` always fail
    /// with that class, `flaky-N` fails transiently for its first N attempts.
    pub fn by_payload(latency: Duration) -> Arc<Self> {
        Self::new(latency, |record, attempt| {
            let payload = std::str::from_utf8(&record.payload).unwrap_or_default();
            match payload {
                "fatal" => Err(InvocationError::fatal("rejected")),
                "throttled" => Err(InvocationError::throttled("429")),
                "transient" => Err(InvocationError::transient("connection reset")),
                p if p.starts_with("flaky-") => {
                    let failures: u32 = p["flaky-".len()..].parse().unwrap_or(0);
                    if attempt <= failures {
                        Err(InvocationError::transient("flaky"))
                    } else {
                        Ok(Bytes::new())
                    }
                }
                _ => Ok(Bytes::new()),
            }
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    /// `(sequence, attempt)` of every call, in the order the calls started.
    pub fn started(&self) -> Vec<(u64, u32)> {
        self.started.lock().unwrap().clone()
    }

    /// Sequences of first attempts, in the order they started.
    pub fn first_deliveries(&self) -> Vec<u64> {
        self.started()
            .into_iter()
            .filter(|(_, attempt)| *attempt == 1)
            .map(|(sequence, _)| sequence)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.started.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn invoke(&self, record: &Record) -> InvokeResult {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(record.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.started.lock().unwrap().push((record.sequence, attempt));

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let result = (self.script)(record, attempt);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Wraps a source and counts the records pulled from it.
pub struct CountingSource<S> {
    inner: S,
    pulled: Arc<AtomicU64>,
}

impl<S> CountingSource<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicU64>) {
        let pulled = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                pulled: Arc::clone(&pulled),
            },
            pulled,
        )
    }
}

#[async_trait]
impl<S: RecordSource> RecordSource for CountingSource<S> {
    async fn next(&mut self) -> Option<SourceItem> {
        let item = self.inner.next().await;
        if item.is_some() {
            self.pulled.fetch_add(1, Ordering::SeqCst);
        }
        item
    }
}

/// `n` payloads that all succeed.
pub fn ok_payloads(n: usize) -> Vec<&'static str> {
    vec!["ok"; n]
}

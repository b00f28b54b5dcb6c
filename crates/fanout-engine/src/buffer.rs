//! Backpressure buffer for decoupled dispatch.
//!
//! Producers block in `enqueue` while the buffer is full, which stalls the
//! dispatch loop and, through it, reading from the source. Consumers pull
//! batches with `dequeue_batch`, waiting at most one poll interval to fill
//! each batch.
//!
//! [`BoundedBuffer`] is a single FIFO lane. [`PartitionedBuffer`] spreads
//! items over several lanes so several consumers can drain in parallel;
//! with one partition it preserves strict FIFO order across the whole
//! buffer.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Delivery order contract of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    /// Strict first-in-first-out across the whole buffer
    Fifo,
    /// No ordering between items; lanes drain independently
    Unordered,
}

/// A bounded queue consumed in batches.
#[async_trait]
pub trait BatchQueue<T: Send + 'static>: Send + Sync {
    /// Adds an item, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Hands the item back if the queue is closed.
    async fn enqueue(&self, item: T) -> Result<(), SendError<T>>;

    /// Takes up to `max` items.
    ///
    /// Waits up to `poll_interval` for the batch to fill and returns what
    /// arrived, possibly nothing. Returns `None` once the queue is closed
    /// and drained.
    async fn dequeue_batch(&self, max: usize, poll_interval: Duration) -> Option<Vec<T>>;

    /// Stops accepting items; queued items can still be dequeued.
    fn close(&self);

    /// Items currently queued.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-lane bounded FIFO queue.
pub struct BoundedBuffer<T> {
    sender: StdMutex<Option<mpsc::Sender<T>>>,
    receiver: Mutex<mpsc::Receiver<T>>,
    queued: AtomicUsize,
    capacity: usize,
}

impl<T: Send + 'static> BoundedBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender: StdMutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            queued: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds an item without waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), TrySendError<T>> {
        let Some(sender) = self.sender() else {
            return Err(TrySendError::Closed(item));
        };
        let result = match sender.try_reserve() {
            Ok(permit) => {
                self.push(permit, item);
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(TrySendError::Full(item)),
            Err(TrySendError::Closed(())) => Err(TrySendError::Closed(item)),
        };
        result
    }

    // Counted before the item becomes visible to consumers, so the
    // matching decrement in `taken` can never run first
    fn push(&self, permit: mpsc::Permit<'_, T>, item: T) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        permit.send(item);
    }

    fn taken(&self, batch: &[T]) {
        self.queued.fetch_sub(batch.len(), Ordering::Relaxed);
    }
}

#[async_trait]
impl<T: Send + 'static> BatchQueue<T> for BoundedBuffer<T> {
    async fn enqueue(&self, item: T) -> Result<(), SendError<T>> {
        let Some(sender) = self.sender() else {
            return Err(SendError(item));
        };
        let result = match sender.reserve().await {
            Ok(permit) => {
                self.push(permit, item);
                Ok(())
            }
            Err(_) => Err(SendError(item)),
        };
        result
    }

    async fn dequeue_batch(&self, max: usize, poll_interval: Duration) -> Option<Vec<T>> {
        let max = max.max(1);
        let deadline = Instant::now() + poll_interval;
        let mut receiver = self.receiver.lock().await;
        let mut batch = Vec::with_capacity(max.min(self.capacity));

        while batch.len() < max {
            match receiver.try_recv() {
                Ok(item) => {
                    batch.push(item);
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }

        self.taken(&batch);
        if batch.is_empty() && receiver.is_closed() && receiver.is_empty() {
            return None;
        }
        Some(batch)
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Several bounded lanes behind one producer interface.
///
/// `enqueue` prefers the next lane in round-robin order, falls back to any
/// lane with room, and only waits when every lane is full.
pub struct PartitionedBuffer<T> {
    lanes: Vec<Arc<BoundedBuffer<T>>>,
    next: AtomicUsize,
}

impl<T: Send + 'static> PartitionedBuffer<T> {
    /// Creates a buffer holding `capacity` items in total.
    ///
    /// FIFO buffers always have a single lane; unordered buffers split the
    /// capacity evenly over `partitions` lanes.
    pub fn new(capacity: usize, partitions: usize, order: DeliveryOrder) -> Self {
        let partitions = match order {
            DeliveryOrder::Fifo => 1,
            DeliveryOrder::Unordered => partitions.max(1),
        };
        let per_lane = capacity.div_ceil(partitions).max(1);

        Self {
            lanes: (0..partitions)
                .map(|_| Arc::new(BoundedBuffer::new(per_lane)))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Consumer handles, one per lane.
    pub fn lanes(&self) -> &[Arc<BoundedBuffer<T>>] {
        &self.lanes
    }

    pub async fn enqueue(&self, item: T) -> Result<(), SendError<T>> {
        let lanes = self.lanes.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % lanes;

        let mut item = item;
        for offset in 0..lanes {
            match self.lanes[(start + offset) % lanes].try_enqueue(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => item = rejected,
                Err(TrySendError::Closed(rejected)) => return Err(SendError(rejected)),
            }
        }

        self.lanes[start].enqueue(item).await
    }

    pub fn close(&self) {
        for lane in &self.lanes {
            lane.close();
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(|lane| lane.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

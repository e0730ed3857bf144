//! Bounded, sharded sample ingest queue.
//!
//! Samples are routed to a shard by hashing the target id, and each shard is
//! drained by exactly one worker, so samples of one target are delivered in
//! arrival order. Total occupancy across all shards is bounded by a semaphore:
//! a sample holds its permit until a worker dequeues it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::sample::Sample;
use super::MonitorError;

/// A sample waiting in the queue, together with its capacity permit.
#[derive(Debug)]
pub struct QueuedSample {
    pub sample: Sample,
    permit: OwnedSemaphorePermit,
}

impl QueuedSample {
    /// Release the queue slot and return the sample.
    pub fn into_sample(self) -> Sample {
        drop(self.permit);
        self.sample
    }
}

pub type ShardReceiver = mpsc::UnboundedReceiver<QueuedSample>;

pub struct IngestQueue {
    shards: Vec<mpsc::UnboundedSender<QueuedSample>>,
    slots: Arc<Semaphore>,
    capacity: usize,
    closed: AtomicBool,
}

impl IngestQueue {
    /// Create a queue and the receivers for each of its shards.
    pub fn new(capacity: usize, shards: usize) -> (Self, Vec<ShardReceiver>) {
        let capacity = capacity.max(1);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..shards.max(1)).map(|_| mpsc::unbounded_channel()).unzip();

        let queue = Self {
            shards: senders,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            closed: AtomicBool::new(false),
        };
        (queue, receivers)
    }

    /// Enqueue a sample without waiting.
    ///
    /// Fails with `Backpressure` when `capacity` samples are already queued.
    pub fn push(&self, sample: Sample) -> Result<(), MonitorError> {
        if self.is_closed() {
            return Err(MonitorError::ShuttingDown);
        }

        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(TryAcquireError::NoPermits) => {
                return Err(MonitorError::Backpressure {
                    capacity: self.capacity,
                })
            }
            Err(TryAcquireError::Closed) => return Err(MonitorError::ShuttingDown),
        };

        let shard = self.shard_for(&sample.target_id);
        self.shards[shard]
            .send(QueuedSample { sample, permit })
            .map_err(|_| MonitorError::ShuttingDown)
    }

    pub fn shard_for(&self, target_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        target_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Samples currently queued.
    pub fn depth(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting samples. Already queued samples stay in the shards.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.slots.close();
            tracing::info!("IngestQueue: Closed with {} samples pending", self.depth());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Discard everything left in a shard, returning how many samples were dropped.
pub fn drain_shard(rx: &mut ShardReceiver) -> usize {
    let mut dropped = 0;
    while let Ok(queued) = rx.try_recv() {
        drop(queued);
        dropped += 1;
    }
    dropped
}

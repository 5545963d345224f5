//! Bounded in-memory queue sitting between the fetch loop and the publish
//! workers.
//!
//! Capacity is always a power of two (`PipelineConfig::from_env` rounds it),
//! so utilization sampling is a cheap shift rather than a division. When
//! full, the configured drop policy decides what happens to the new or the
//! oldest entry; `DropPolicy::None` instead makes `try_enqueue` block the
//! caller by returning a backpressure signal it must retry against.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bridge_config::DropPolicy;
use bridge_domain::StreamEntry;
use tokio::sync::Notify;
use tracing::warn;

pub struct Queue {
    capacity: usize,
    drop_policy: DropPolicy,
    items: Mutex<VecDeque<StreamEntry>>,
    dropped: AtomicU64,
    /// Notified on every successful dequeue, so a `DropPolicy::None` producer
    /// blocked on a full queue can wake and retry without polling.
    space_available: Notify,
}

pub enum EnqueueOutcome {
    Enqueued,
    Dropped(StreamEntry),
    Rejected(StreamEntry),
}

impl Queue {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            drop_policy,
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            dropped: AtomicU64::new(0),
            space_available: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Enqueues `entry`, applying the configured drop policy if the queue is
    /// already at capacity.
    pub fn enqueue(&self, entry: StreamEntry) -> EnqueueOutcome {
        let mut items = self.items.lock().unwrap();

        if items.len() < self.capacity {
            items.push_back(entry);
            return EnqueueOutcome::Enqueued;
        }

        match self.drop_policy {
            DropPolicy::Oldest => {
                let evicted = items.pop_front();
                items.push_back(entry);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(evicted) = evicted {
                    warn!(stream = %evicted.stream, id = %evicted.id, "dropped oldest entry, queue full");
                    EnqueueOutcome::Dropped(evicted)
                } else {
                    EnqueueOutcome::Enqueued
                }
            }
            DropPolicy::Newest => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(stream = %entry.stream, id = %entry.id, "dropped newest entry, queue full");
                EnqueueOutcome::Dropped(entry)
            }
            DropPolicy::None => EnqueueOutcome::Rejected(entry),
        }
    }

    pub fn dequeue(&self) -> Option<StreamEntry> {
        let item = self.items.lock().unwrap().pop_front();
        if item.is_some() {
            self.space_available.notify_one();
        }
        item
    }

    pub fn dequeue_batch(&self, max: usize) -> Vec<StreamEntry> {
        let mut items = self.items.lock().unwrap();
        let n = max.min(items.len());
        let drained: Vec<_> = items.drain(..n).collect();
        drop(items);
        if !drained.is_empty() {
            self.space_available.notify_one();
        }
        drained
    }

    /// Enqueues `entry`, blocking (honoring cancellation via `cancelled`)
    /// when the queue is full and the drop policy is `None`. Returns `false`
    /// if `cancelled` fired before space became available.
    pub async fn enqueue_blocking<F>(&self, mut entry: StreamEntry, mut cancelled: F) -> bool
    where
        F: std::future::Future<Output = ()> + Unpin,
    {
        loop {
            match self.enqueue(entry) {
                EnqueueOutcome::Enqueued | EnqueueOutcome::Dropped(_) => return true,
                EnqueueOutcome::Rejected(rejected) => {
                    entry = rejected;
                    tokio::select! {
                        _ = &mut cancelled => return false,
                        _ = self.space_available.notified() => {}
                    }
                }
            }
        }
    }
}

// src/core/process/queue.rs

//! The process work queue: a min-heap keyed by ready-time with a
//! deduplicating enqueue that only ever tightens an entry's ready-time, plus
//! the backoff and jitter helpers used by the requeue policy.

use crate::core::metrics;
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// Applies a uniform random jitter of `±factor` to a duration.
/// `factor` is clamped to `[0, 1]`.
pub fn jitter(d: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 {
        return d;
    }
    let offset: f64 = rand::thread_rng().gen_range(-factor..=factor);
    d.mul_f64(1.0 + offset)
}

/// `min(base · 2^attempt, max)` with ±25% jitter. Attempt 0 is the first
/// retry.
pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let capped = base
        .saturating_mul(2u32.saturating_pow(attempt.min(31)))
        .min(max);
    jitter(capped, 0.25)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    ready_at: Instant,
    seq: u64,
    id: String,
}

#[derive(Debug, Default)]
struct QueueInner {
    /// Min-heap of candidate entries. Entries whose ready-time no longer
    /// matches the authoritative map are stale and skipped at dequeue.
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Authoritative ready-time per id.
    ready: HashMap<String, Instant>,
    seq: u64,
}

/// A single-writer / single-reader priority queue keyed by ready-time.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `id` to become ready after `delay`. If the id is already
    /// queued, its ready-time is updated only when the new one is earlier;
    /// a later ready-time is a no-op. Every call signals the wait channel.
    pub fn enqueue(&self, id: &str, delay: Duration) {
        let ready_at = Instant::now() + delay;
        {
            let mut inner = self.inner.lock();
            let tighten = match inner.ready.get(id) {
                Some(existing) => ready_at < *existing,
                None => true,
            };
            if tighten {
                inner.ready.insert(id.to_string(), ready_at);
                inner.seq += 1;
                let seq = inner.seq;
                inner.heap.push(Reverse(HeapEntry {
                    ready_at,
                    seq,
                    id: id.to_string(),
                }));
            }
            metrics::WORK_QUEUE_DEPTH.set(inner.ready.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Pops the head entry if its ready-time has passed. Stale heap entries
    /// left behind by tightening enqueues are discarded on the way.
    pub fn dequeue(&self) -> Option<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        loop {
            let head = inner.heap.peek()?;
            let entry = &head.0;
            match inner.ready.get(&entry.id) {
                Some(current) if *current == entry.ready_at => {
                    if entry.ready_at > now {
                        return None;
                    }
                    let id = entry.id.clone();
                    inner.heap.pop();
                    inner.ready.remove(&id);
                    metrics::WORK_QUEUE_DEPTH.set(inner.ready.len() as f64);
                    return Some(id);
                }
                _ => {
                    // Stale entry superseded by a tighter enqueue or already
                    // dequeued.
                    inner.heap.pop();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The stored ready-time of a queued id, if any. Used by tests and by
    /// the consumer's idle estimation.
    pub fn ready_at(&self, id: &str) -> Option<Instant> {
        self.inner.lock().ready.get(id).copied()
    }

    /// Returns a notification that fires on every enqueue. Consumers pair it
    /// with a one-second periodic tick to cover missed notifications.
    pub fn wait(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

//! ACGS-Telemetry: Bounded Drop-Oldest Queue
//!
//! The primitive under both telemetry pipelines. Push never blocks and
//! never fails: a full queue evicts its oldest record and the drop is
//! counted so health can surface it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded in-process queue with drop-oldest overflow.
pub struct FireAndForgetQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FireAndForgetQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity: capacity.max(1),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// O(1) enqueue. On overflow the oldest record is dropped, never the
    /// one being pushed.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            inner.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        inner.push_back(item);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Take up to `max` records from the front.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.len());
        inner.drain(..take).collect()
    }

    /// Push records back to the front, preserving their order (used when
    /// a flush finds every sink down). The restored records are older
    /// than anything queued since, so on overflow the head of the batch
    /// is dropped, never the newer records behind it.
    pub fn requeue_front(&self, mut items: Vec<T>) {
        let mut inner = self.inner.lock();
        let room = self.capacity.saturating_sub(inner.len());
        if items.len() > room {
            let overflow = items.len() - room;
            items.drain(..overflow);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        for item in items.into_iter().rev() {
            inner.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! ACGS-Deliberation: Review Queue
//!
//! FIFO within a tier, strict priority across tiers (CRITICAL > HIGH >
//! NORMAL > LOW). Items are durable: every mutation is reflected in the
//! backing JSON store so a restart resumes pending reviews.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use acgs_core::{BusError, JsonStore};

use crate::item::{DeliberationItem, DeliberationState};

struct QueueInner {
    items: HashMap<Uuid, DeliberationItem>,
    // Monotonic arrival stamps give FIFO inside a tier
    arrivals: HashMap<Uuid, u64>,
    next_arrival: u64,
}

/// Durable deliberation queue (C8).
pub struct DeliberationQueue {
    inner: Mutex<QueueInner>,
    store: Option<Arc<JsonStore<DeliberationItem>>>,
}

impl DeliberationQueue {
    /// In-memory queue (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: HashMap::new(),
                arrivals: HashMap::new(),
                next_arrival: 0,
            }),
            store: None,
        }
    }

    /// Durable queue backed by a JSON store; unresolved items are
    /// restored on open.
    pub fn durable(store: Arc<JsonStore<DeliberationItem>>) -> Result<Self, BusError> {
        let queue = Self {
            inner: Mutex::new(QueueInner {
                items: HashMap::new(),
                arrivals: HashMap::new(),
                next_arrival: 0,
            }),
            store: Some(store.clone()),
        };
        {
            let mut inner = queue.inner.lock();
            for item in store.load()? {
                if !item.state.is_terminal() {
                    let stamp = inner.next_arrival;
                    inner.next_arrival += 1;
                    inner.arrivals.insert(item.item_id, stamp);
                    inner.items.insert(item.item_id, item);
                }
            }
        }
        Ok(queue)
    }

    fn persist(&self, inner: &QueueInner) -> Result<(), BusError> {
        if let Some(store) = &self.store {
            let items: Vec<DeliberationItem> = inner.items.values().cloned().collect();
            store.replace_all(&items)?;
        }
        Ok(())
    }

    /// Enqueue an item for review.
    pub fn enqueue(&self, item: DeliberationItem) -> Result<Uuid, BusError> {
        let mut inner = self.inner.lock();
        let id = item.item_id;
        let stamp = inner.next_arrival;
        inner.next_arrival += 1;
        inner.arrivals.insert(id, stamp);
        inner.items.insert(id, item);
        self.persist(&inner)?;
        tracing::debug!(item_id = %id, "deliberation item enqueued");
        Ok(id)
    }

    pub fn get(&self, item_id: Uuid) -> Option<DeliberationItem> {
        self.inner.lock().items.get(&item_id).cloned()
    }

    /// Apply a mutation to one item and persist the result.
    pub fn with_item<R>(
        &self,
        item_id: Uuid,
        f: impl FnOnce(&mut DeliberationItem) -> Result<R, BusError>,
    ) -> Result<R, BusError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .get_mut(&item_id)
            .ok_or_else(|| BusError::internal(format!("unknown deliberation item {item_id}")))?;
        let result = f(item)?;
        self.persist(&inner)?;
        Ok(result)
    }

    /// Non-terminal items in review order: tier first, then arrival.
    pub fn open_items(&self) -> Vec<DeliberationItem> {
        let inner = self.inner.lock();
        let mut open: Vec<(&DeliberationItem, u64)> = inner
            .items
            .values()
            .filter(|item| !item.state.is_terminal())
            .map(|item| (item, inner.arrivals.get(&item.item_id).copied().unwrap_or(0)))
            .collect();
        open.sort_by(|(a, sa), (b, sb)| a.tier().cmp(&b.tier()).then(sa.cmp(sb)));
        open.into_iter().map(|(item, _)| item.clone()).collect()
    }

    /// Transition every overdue item to timeout. Returns the expired ids.
    pub fn expire_due(&self) -> Result<Vec<Uuid>, BusError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        let due: Vec<Uuid> = inner
            .items
            .values()
            .filter(|item| item.is_expired(now))
            .map(|item| item.item_id)
            .collect();
        for id in due {
            if let Some(item) = inner.items.get_mut(&id) {
                if item.transition(DeliberationState::Timeout).is_ok() {
                    tracing::warn!(item_id = %id, "deliberation item timed out");
                    expired.push(id);
                }
            }
        }
        if !expired.is_empty() {
            self.persist(&inner)?;
        }
        Ok(expired)
    }

    /// Remove and return items that reached a terminal state.
    pub fn drain_resolved(&self) -> Result<Vec<DeliberationItem>, BusError> {
        let mut inner = self.inner.lock();
        let resolved_ids: Vec<Uuid> = inner
            .items
            .values()
            .filter(|item| item.state.is_terminal())
            .map(|item| item.item_id)
            .collect();
        let mut resolved = Vec::new();
        for id in resolved_ids {
            if let Some(item) = inner.items.remove(&id) {
                inner.arrivals.remove(&id);
                resolved.push(item);
            }
        }
        if !resolved.is_empty() {
            self.persist(&inner)?;
        }
        Ok(resolved)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::{MessageEnvelope, MessageType, Priority};

    const HASH: &str = "cdd01ef066bc6cf2";

    fn item(priority: Priority, deadline_secs: u64) -> DeliberationItem {
        let msg = MessageEnvelope::new("exec-1", "jud-1", MessageType::Command, HASH)
            .with_priority(priority);
        DeliberationItem::new(msg, 0.9, "score", false, false, 1, deadline_secs)
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = DeliberationQueue::in_memory();
        let a = queue.enqueue(item(Priority::Normal, 300)).unwrap();
        let b = queue.enqueue(item(Priority::Normal, 300)).unwrap();

        let open = queue.open_items();
        assert_eq!(open[0].item_id, a);
        assert_eq!(open[1].item_id, b);
    }

    #[test]
    fn test_priority_preempts_tier() {
        let queue = DeliberationQueue::in_memory();
        let normal = queue.enqueue(item(Priority::Normal, 300)).unwrap();
        let critical = queue.enqueue(item(Priority::Critical, 300)).unwrap();
        let high = queue.enqueue(item(Priority::High, 300)).unwrap();

        let open = queue.open_items();
        assert_eq!(open[0].item_id, critical);
        assert_eq!(open[1].item_id, high);
        assert_eq!(open[2].item_id, normal);
    }

    #[test]
    fn test_expire_due() {
        let queue = DeliberationQueue::in_memory();
        let id = queue.enqueue(item(Priority::Normal, 0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let expired = queue.expire_due().unwrap();
        assert_eq!(expired, vec![id]);
        assert_eq!(queue.get(id).unwrap().state, DeliberationState::Timeout);
    }

    #[test]
    fn test_drain_resolved() {
        let queue = DeliberationQueue::in_memory();
        let id = queue.enqueue(item(Priority::Normal, 300)).unwrap();
        queue
            .with_item(id, |item| item.transition(DeliberationState::Approved))
            .unwrap();

        let resolved = queue.drain_resolved().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].state, DeliberationState::Approved);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_durable_restore_skips_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<JsonStore<DeliberationItem>> =
            Arc::new(JsonStore::open(dir.path().join("items.jsonl")).unwrap());

        {
            let queue = DeliberationQueue::durable(store.clone()).unwrap();
            let open_id = queue.enqueue(item(Priority::Normal, 300)).unwrap();
            let done_id = queue.enqueue(item(Priority::Normal, 300)).unwrap();
            queue
                .with_item(done_id, |item| item.transition(DeliberationState::Rejected))
                .unwrap();
            assert_ne!(open_id, done_id);
        }

        let restored = DeliberationQueue::durable(store).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.open_items().len(), 1);
    }
}

//! ACGS-Telemetry: Audit Pipeline
//!
//! Every terminal outcome produces a compact audit entry carrying the
//! constitutional hash and policy fingerprint. Emission is fire-and-forget;
//! a background worker batches entries and anchors them to the configured
//! sinks through per-sink circuit breakers. One acknowledging sink is
//! enough; a batch nobody acks goes back on the queue and competes under
//! drop-oldest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use acgs_core::error::Severity;
use acgs_core::{AuditConfig, BusError};
use acgs_resilience::{BreakerRegistry, ChaosInjector};

use crate::queue::FireAndForgetQueue;

/// How many anchored entries the in-process tail keeps for queries.
const RECENT_CAPACITY: usize = 4_096;

/// A tamper-evident audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub message_id: Uuid,
    /// Terminal outcome label ("delivered", "rejected", ...)
    pub decision: String,
    pub severity: Severity,
    pub policy_fingerprint: Option<String>,
    pub score: Option<f64>,
    pub routing_lane: Option<String>,
    pub votes_digest: Option<String>,
    pub constitutional_hash: String,
    /// Warning tags ("fail_open", "cancelled_late", ...)
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub anchored_at: Option<DateTime<Utc>>,
}

impl AuditEntry {
    pub fn new(
        message_id: Uuid,
        decision: impl Into<String>,
        constitutional_hash: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            decision: decision.into(),
            severity: Severity::Info,
            policy_fingerprint: None,
            score: None,
            routing_lane: None,
            votes_digest: None,
            constitutional_hash: constitutional_hash.into(),
            tags: Vec::new(),
            created_at: Utc::now(),
            anchored_at: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.policy_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.routing_lane = Some(lane.into());
        self
    }

    pub fn with_votes_digest(mut self, digest: impl Into<String>) -> Self {
        self.votes_digest = Some(digest.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// External audit backend: `anchor(entries) -> ack | error`.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;
    async fn anchor(&self, entries: &[AuditEntry]) -> Result<(), BusError>;
}

/// In-memory sink for tests and local runs.
pub struct MemoryAuditSink {
    name: String,
    anchored: Mutex<Vec<AuditEntry>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryAuditSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            anchored: Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn anchored(&self) -> Vec<AuditEntry> {
        self.anchored.lock().clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn anchor(&self, entries: &[AuditEntry]) -> Result<(), BusError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::internal("audit sink down"));
        }
        self.anchored.lock().extend_from_slice(entries);
        Ok(())
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    pub emitted: u64,
    pub anchored: u64,
    pub dropped: u64,
}

/// Audit pipeline (C14).
pub struct AuditPipeline {
    queue: FireAndForgetQueue<AuditEntry>,
    sinks: Vec<Arc<dyn AuditSink>>,
    breakers: Arc<BreakerRegistry>,
    chaos: Arc<ChaosInjector>,
    config: AuditConfig,
    recent: Mutex<VecDeque<AuditEntry>>,
    anchored: AtomicU64,
    chaos_dropped: AtomicU64,
}

impl AuditPipeline {
    pub fn new(
        config: AuditConfig,
        sinks: Vec<Arc<dyn AuditSink>>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            queue: FireAndForgetQueue::new(config.queue_size),
            sinks,
            breakers,
            chaos: Arc::new(ChaosInjector::disabled()),
            config,
            recent: Mutex::new(VecDeque::new()),
            anchored: AtomicU64::new(0),
            chaos_dropped: AtomicU64::new(0),
        }
    }

    pub fn with_chaos(mut self, chaos: Arc<ChaosInjector>) -> Self {
        self.chaos = chaos;
        self
    }

    /// Fire-and-forget emission; never blocks the caller.
    pub fn emit(&self, entry: AuditEntry) {
        if self.chaos.intercept("audit.enqueue").is_some() {
            // Injected enqueue fault counts as a drop, visible in health
            self.chaos_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(message_id = %entry.message_id, "audit enqueue fault injected");
            return;
        }
        self.queue.push(entry);
    }

    /// Drain one batch and anchor it. Success requires at least one sink
    /// acknowledging; a fully failed batch is requeued at the front.
    pub async fn flush_once(&self) -> usize {
        let batch = self.queue.drain(self.config.batch_size);
        if batch.is_empty() {
            return 0;
        }

        let mut anchored = batch.clone();
        let now = Utc::now();
        for entry in &mut anchored {
            entry.anchored_at = Some(now);
        }

        let mut acked = false;
        for sink in &self.sinks {
            let breaker = self.breakers.breaker(sink.name());
            let result = breaker.call(sink.anchor(&anchored)).await;
            match result {
                Ok(()) => acked = true,
                Err(err) => {
                    tracing::warn!(sink = sink.name(), error = %err, "audit anchor failed");
                }
            }
        }

        if !acked {
            self.queue.requeue_front(batch);
            return 0;
        }

        let count = anchored.len();
        self.anchored.fetch_add(count as u64, Ordering::Relaxed);
        let mut recent = self.recent.lock();
        for entry in anchored {
            if recent.len() >= RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(entry);
        }
        count
    }

    /// Flush until the queue is empty or no sink acks.
    pub async fn flush_all(&self) {
        loop {
            if self.queue.is_empty() || self.flush_once().await == 0 {
                break;
            }
        }
    }

    /// Background flusher.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.flush_interval_ms.max(1)));
        loop {
            ticker.tick().await;
            self.flush_once().await;
        }
    }

    /// Anchored entry for a message, if still in the in-process tail.
    pub fn find(&self, message_id: Uuid) -> Option<AuditEntry> {
        self.recent
            .lock()
            .iter()
            .rev()
            .find(|e| e.message_id == message_id)
            .cloned()
    }

    /// Anchored entries at or above a severity.
    pub fn query_by_severity(&self, min: Severity) -> Vec<AuditEntry> {
        self.recent
            .lock()
            .iter()
            .filter(|e| e.severity >= min)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            emitted: self.queue.enqueued(),
            anchored: self.anchored.load(Ordering::Relaxed),
            dropped: self.dropped(),
        }
    }

    /// Records lost before anchoring: queue overflow plus injected
    /// enqueue faults.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped() + self.chaos_dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::BreakerConfig;

    const HASH: &str = "cdd01ef066bc6cf2";

    fn pipeline(sink: Arc<MemoryAuditSink>) -> AuditPipeline {
        AuditPipeline::new(
            AuditConfig {
                queue_size: 16,
                flush_interval_ms: 10,
                batch_size: 4,
            },
            vec![sink],
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_emit_and_anchor() {
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = pipeline(sink.clone());

        let id = Uuid::now_v7();
        pipeline.emit(AuditEntry::new(id, "delivered", HASH).with_score(0.2));
        let flushed = pipeline.flush_once().await;

        assert_eq!(flushed, 1);
        let anchored = sink.anchored();
        assert_eq!(anchored.len(), 1);
        assert_eq!(anchored[0].message_id, id);
        assert_eq!(anchored[0].constitutional_hash, HASH);
        assert!(anchored[0].anchored_at.is_some());
        assert_eq!(pipeline.find(id).unwrap().decision, "delivered");
    }

    #[tokio::test]
    async fn test_batching() {
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = pipeline(sink.clone());

        for _ in 0..10 {
            pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));
        }
        assert_eq!(pipeline.flush_once().await, 4);
        pipeline.flush_all().await;
        assert_eq!(sink.anchored().len(), 10);
    }

    #[tokio::test]
    async fn test_failed_batch_requeued() {
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = pipeline(sink.clone());
        sink.set_failing(true);

        pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));
        assert_eq!(pipeline.flush_once().await, 0);
        // Still queued; recovers once the sink does
        sink.set_failing(false);
        assert_eq!(pipeline.flush_once().await, 1);
        assert_eq!(sink.anchored().len(), 1);
    }

    #[tokio::test]
    async fn test_one_ack_suffices() {
        let down = Arc::new(MemoryAuditSink::new("down"));
        down.set_failing(true);
        let up = Arc::new(MemoryAuditSink::new("up"));
        let pipeline = AuditPipeline::new(
            AuditConfig::default(),
            vec![down.clone(), up.clone()],
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        );

        pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));
        assert_eq!(pipeline.flush_once().await, 1);
        assert_eq!(up.anchored().len(), 1);
        assert!(down.anchored().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = AuditPipeline::new(
            AuditConfig {
                queue_size: 2,
                flush_interval_ms: 10,
                batch_size: 4,
            },
            vec![sink],
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        );

        for _ in 0..5 {
            pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));
        }
        assert_eq!(pipeline.dropped(), 3);
    }

    #[tokio::test]
    async fn test_chaos_enqueue_fault_counts_as_drop() {
        use acgs_core::{ChaosProfile, Environment};
        use acgs_resilience::ChaosInjector;

        let chaos = Arc::new(ChaosInjector::from_config(
            Environment::Staging,
            Some(ChaosProfile {
                name: "audit-drop-drill".to_string(),
                seed: 1,
                blast_radius: 1.0,
                points: [("audit.enqueue".to_string(), 1.0)].into_iter().collect(),
            }),
        ));
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = pipeline(sink.clone()).with_chaos(chaos);

        pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));

        // The injected fault surfaces as a drop in stats and health
        assert_eq!(pipeline.dropped(), 1);
        assert_eq!(pipeline.stats().dropped, 1);
        assert_eq!(pipeline.flush_once().await, 0);
        assert!(sink.anchored().is_empty());
    }

    #[tokio::test]
    async fn test_severity_query() {
        let sink = Arc::new(MemoryAuditSink::new("memory"));
        let pipeline = pipeline(sink);

        pipeline.emit(AuditEntry::new(Uuid::now_v7(), "delivered", HASH));
        pipeline.emit(
            AuditEntry::new(Uuid::now_v7(), "rejected", HASH).with_severity(Severity::Elevated),
        );
        pipeline.flush_all().await;

        let elevated = pipeline.query_by_severity(Severity::Elevated);
        assert_eq!(elevated.len(), 1);
        assert_eq!(elevated[0].decision, "rejected");
    }
}

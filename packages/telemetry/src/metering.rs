//! ACGS-Telemetry: Metering Queue
//!
//! Usage events for usage-based billing. Recording is a sub-microsecond
//! push into the bounded queue; a background worker batches events out to
//! the billing sink through a circuit breaker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acgs_core::{BusError, MeteringConfig};
use acgs_resilience::BreakerRegistry;

use crate::queue::FireAndForgetQueue;

/// Billable metric types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Messages through the processor
    MessagesProcessed,
    /// Policy evaluations (cache misses)
    PolicyChecks,
    /// Impact model invocations
    ImpactScores,
    /// Items routed to deliberation
    Deliberations,
    /// Audit entries anchored
    AuditsAnchored,
    /// Compute time (ms)
    ComputeMs,
}

impl MetricType {
    pub fn unit_name(&self) -> &'static str {
        match self {
            Self::MessagesProcessed => "messages",
            Self::PolicyChecks => "checks",
            Self::ImpactScores => "scores",
            Self::Deliberations => "items",
            Self::AuditsAnchored => "entries",
            Self::ComputeMs => "ms",
        }
    }
}

/// One usage event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: uuid::Uuid,
    pub tenant_id: String,
    pub metric: MetricType,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl UsageEvent {
    pub fn new(tenant_id: impl Into<String>, metric: MetricType, quantity: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            metric,
            quantity,
            timestamp: Utc::now(),
            properties: HashMap::new(),
        }
    }

    pub fn message_processed(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, MetricType::MessagesProcessed, 1)
    }

    pub fn policy_check(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, MetricType::PolicyChecks, 1)
    }

    pub fn deliberation(tenant_id: impl Into<String>) -> Self {
        Self::new(tenant_id, MetricType::Deliberations, 1)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// External billing sink.
#[async_trait]
pub trait MeteringSink: Send + Sync {
    fn name(&self) -> &str;
    async fn record(&self, events: &[UsageEvent]) -> Result<(), BusError>;
}

/// In-memory sink for tests.
pub struct MemoryMeteringSink {
    recorded: Mutex<Vec<UsageEvent>>,
}

impl Default for MemoryMeteringSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMeteringSink {
    pub fn new() -> Self {
        Self {
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<UsageEvent> {
        self.recorded.lock().clone()
    }
}

#[async_trait]
impl MeteringSink for MemoryMeteringSink {
    fn name(&self) -> &str {
        "memory-metering"
    }

    async fn record(&self, events: &[UsageEvent]) -> Result<(), BusError> {
        self.recorded.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default)]
pub struct MeteringStats {
    pub recorded: u64,
    pub flushed: u64,
    pub dropped: u64,
}

/// Metering queue (C15).
pub struct MeteringQueue {
    queue: FireAndForgetQueue<UsageEvent>,
    sink: Arc<dyn MeteringSink>,
    breakers: Arc<BreakerRegistry>,
    enabled: bool,
    flushed: AtomicU64,
}

impl MeteringQueue {
    pub fn new(
        config: &MeteringConfig,
        sink: Arc<dyn MeteringSink>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            queue: FireAndForgetQueue::new(config.queue_size),
            sink,
            breakers,
            enabled: config.enabled,
            flushed: AtomicU64::new(0),
        }
    }

    /// O(1) record; a disabled queue is a no-op.
    pub fn record(&self, event: UsageEvent) {
        if !self.enabled {
            return;
        }
        self.queue.push(event);
    }

    /// Drain one batch to the sink through its breaker.
    pub async fn flush_once(&self, batch_size: usize) -> usize {
        let batch = self.queue.drain(batch_size.max(1));
        if batch.is_empty() {
            return 0;
        }
        let breaker = self.breakers.breaker(self.sink.name());
        match breaker.call(self.sink.record(&batch)).await {
            Ok(()) => {
                let count = batch.len();
                self.flushed.fetch_add(count as u64, Ordering::Relaxed);
                count
            }
            Err(err) => {
                tracing::warn!(error = %err, "metering flush failed");
                self.queue.requeue_front(batch);
                0
            }
        }
    }

    /// Background drain loop.
    pub async fn run(self: Arc<Self>, interval: Duration, batch_size: usize) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.flush_once(batch_size).await;
        }
    }

    pub fn stats(&self) -> MeteringStats {
        MeteringStats {
            recorded: self.queue.enqueued(),
            flushed: self.flushed.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

//! ACGS-Bus: Deliberation Worker
//!
//! Drives the slow lane to completion: expires overdue items, pushes
//! pending HITL items to the notifier, delivers approved items and
//! dead-letters rejections and timeouts (timeout denies by default).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use acgs_core::error::Severity;
use acgs_core::BusError;
use acgs_deliberation::{
    votes_digest, DeliberationItem, DeliberationQueue, DeliberationState, HitlManager,
};
use acgs_telemetry::{AuditEntry, AuditPipeline};

use crate::bus::AgentBus;

/// Background resolution worker for the deliberation lane.
pub struct DeliberationWorker {
    queue: Arc<DeliberationQueue>,
    hitl: Arc<HitlManager>,
    bus: Arc<AgentBus>,
    audit: Arc<AuditPipeline>,
    constitutional_hash: String,
    // Approved items whose recipient inbox was full; retried next pump
    redelivery: Mutex<Vec<DeliberationItem>>,
}

impl DeliberationWorker {
    pub fn new(
        queue: Arc<DeliberationQueue>,
        hitl: Arc<HitlManager>,
        bus: Arc<AgentBus>,
        audit: Arc<AuditPipeline>,
        constitutional_hash: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            hitl,
            bus,
            audit,
            constitutional_hash: constitutional_hash.into(),
            redelivery: Mutex::new(Vec::new()),
        }
    }

    fn audit_resolution(&self, item: &DeliberationItem, decision: &str, severity: Severity) {
        let entry = AuditEntry::new(
            item.message.message_id,
            decision,
            self.constitutional_hash.clone(),
        )
        .with_severity(severity)
        .with_score(item.impact_score)
        .with_lane("deliberation")
        .with_votes_digest(votes_digest(item));
        self.audit.emit(entry);
    }

    fn deliver_approved(&self, item: DeliberationItem) {
        match self.bus.deliver(item.message.clone()) {
            Ok(()) => {
                self.audit_resolution(&item, "deliberation_approved", Severity::Info);
            }
            Err(BusError::Backpressure { .. }) => {
                // Accepted messages are never dropped; retry next pump
                self.redelivery.lock().push(item);
            }
            Err(error) => {
                tracing::warn!(
                    item_id = %item.item_id,
                    error = %error,
                    "approved item undeliverable"
                );
                self.audit_resolution(&item, "deliberation_undeliverable", Severity::Warning);
                self.bus
                    .dead_letter(item.message.clone(), format!("undeliverable: {error}"));
            }
        }
    }

    /// One resolution pass. Callable directly from tests; the background
    /// loop calls it on an interval.
    pub async fn pump(&self) -> usize {
        if let Err(err) = self.queue.expire_due() {
            tracing::error!(error = %err, "deliberation expiry failed");
        }
        self.hitl.dispatch_pending().await;

        // Retry approved items that hit backpressure earlier.
        let retries: Vec<DeliberationItem> = self.redelivery.lock().drain(..).collect();
        for item in retries {
            self.deliver_approved(item);
        }

        let resolved = match self.queue.drain_resolved() {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(error = %err, "deliberation drain failed");
                return 0;
            }
        };
        let count = resolved.len();

        for item in resolved {
            match item.state {
                DeliberationState::Approved => self.deliver_approved(item),
                DeliberationState::Rejected => {
                    self.audit_resolution(&item, "deliberation_rejected", Severity::Warning);
                    self.bus
                        .dead_letter(item.message.clone(), "rejected in deliberation");
                }
                DeliberationState::Timeout => {
                    // Conservative default: timeout denies
                    self.audit_resolution(&item, "deliberation_timeout", Severity::Warning);
                    self.bus
                        .dead_letter(item.message.clone(), "deliberation deadline passed");
                }
                _ => {}
            }
        }
        count
    }

    /// Background loop.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.pump().await;
        }
    }
}

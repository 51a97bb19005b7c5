//! ACGS-Bus: Message Processor
//!
//! The per-message pipeline (C12): constitutional check, role check,
//! policy evaluation, impact scoring, routing, dispatch, audit. Stages
//! run in strict order and short-circuit on the first typed error; every
//! terminal outcome is audited and metered fire-and-forget. Per
//! (from, to) pair the pipeline is serialized on a fair lock, so delivery
//! order equals acceptance order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use acgs_core::{
    BusConfig, BusError, ConstitutionalValidator, MessageEnvelope, ProcessContext,
};
use acgs_deliberation::{DeliberationItem, DeliberationQueue};
use acgs_governance::{
    AdaptiveRouter, ImpactScorer, Lane, MaciAction, PolicyClient, RoleRegistry, RouteDecision,
    RouteReason,
};
use acgs_resilience::ChaosInjector;
use acgs_telemetry::{AuditEntry, AuditPipeline, MeteringQueue, UsageEvent};

use crate::bus::AgentBus;

/// Terminal outcome of one `process` call. Senders see structured error
/// kinds, never panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Delivered,
    QueuedForDeliberation { item_id: Uuid },
    Rejected { error: BusError },
}

impl ProcessOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn rejection(&self) -> Option<&BusError> {
        match self {
            Self::Rejected { error } => Some(error),
            _ => None,
        }
    }

    fn decision_label(&self) -> String {
        match self {
            Self::Delivered => "delivered".to_string(),
            Self::QueuedForDeliberation { .. } => "queued_for_deliberation".to_string(),
            Self::Rejected { error } => format!("rejected:{}", error.kind()),
        }
    }
}

/// Processor counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub delivered: u64,
    pub deliberated: u64,
    pub rejected: u64,
}

struct StageResult {
    outcome: ProcessOutcome,
    fingerprint: Option<String>,
    score: Option<f64>,
    lane: Option<Lane>,
    tags: Vec<String>,
}

/// The message processor (C12).
pub struct MessageProcessor {
    config: BusConfig,
    validator: ConstitutionalValidator,
    roles: Arc<RoleRegistry>,
    policy: Arc<PolicyClient>,
    scorer: Arc<ImpactScorer>,
    router: AdaptiveRouter,
    bus: Arc<AgentBus>,
    deliberations: Arc<DeliberationQueue>,
    audit: Arc<AuditPipeline>,
    metering: Arc<MeteringQueue>,
    chaos: Arc<ChaosInjector>,
    pair_locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
    processed: AtomicU64,
    delivered: AtomicU64,
    deliberated: AtomicU64,
    rejected: AtomicU64,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BusConfig,
        validator: ConstitutionalValidator,
        roles: Arc<RoleRegistry>,
        policy: Arc<PolicyClient>,
        scorer: Arc<ImpactScorer>,
        bus: Arc<AgentBus>,
        deliberations: Arc<DeliberationQueue>,
        audit: Arc<AuditPipeline>,
        metering: Arc<MeteringQueue>,
    ) -> Self {
        let router = AdaptiveRouter::new(config.routing.clone(), config.deliberation.clone());
        Self {
            config,
            validator,
            roles,
            policy,
            scorer,
            router,
            bus,
            deliberations,
            audit,
            metering,
            chaos: Arc::new(ChaosInjector::disabled()),
            pair_locks: Mutex::new(HashMap::new()),
            processed: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            deliberated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_chaos(mut self, chaos: Arc<ChaosInjector>) -> Self {
        self.chaos = chaos;
        self
    }

    fn pair_lock(&self, msg: &MessageEnvelope) -> Arc<tokio::sync::Mutex<()>> {
        self.pair_locks
            .lock()
            .entry(msg.pair_key())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Process one message through the full pipeline.
    pub async fn process(&self, ctx: &ProcessContext, msg: MessageEnvelope) -> ProcessOutcome {
        // Acceptance order per (from, to) pair is fixed here: the tokio
        // mutex is fair, so dispatch below preserves FIFO per pair.
        let pair_lock = self.pair_lock(&msg);
        let _ordering_guard = pair_lock.lock().await;

        self.processed.fetch_add(1, Ordering::Relaxed);
        let result = self.run_stages(ctx, &msg).await;

        match &result.outcome {
            ProcessOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.bus.touch(&msg.from_agent);
            }
            ProcessOutcome::QueuedForDeliberation { .. } => {
                self.deliberated.fetch_add(1, Ordering::Relaxed);
                self.bus.touch(&msg.from_agent);
            }
            ProcessOutcome::Rejected { error } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    message_id = %msg.message_id,
                    error = %error,
                    "message rejected"
                );
            }
        }

        self.emit_audit(&msg, &result);
        self.emit_metering(&msg, &result);
        result.outcome
    }

    async fn run_stages(&self, ctx: &ProcessContext, msg: &MessageEnvelope) -> StageResult {
        let mut tags = Vec::new();

        // Stage 1: constitutional validation. Never retried.
        if let Err(error) = ctx.check() {
            return StageResult::rejected(error, tags);
        }
        if let Err(error) = self.validator.validate(msg) {
            return StageResult::rejected(error, tags);
        }

        // Stage 2: role separation. Never retried.
        let action = MaciAction::derive(msg.message_type, msg.action());
        if let Err(error) = self.roles.authorize(&msg.from_agent, action) {
            return StageResult::rejected(error, tags);
        }
        if let Err(error) = self.bus.admit_sender(msg) {
            return StageResult::rejected(error, tags);
        }

        // Stage 3: policy evaluation (cached, breaker-guarded).
        if let Err(error) = ctx.check() {
            return StageResult::rejected(error, tags);
        }
        let policy_input = serde_json::json!({
            "from_agent": msg.from_agent,
            "to_agent": msg.to_agent,
            "message_type": msg.message_type,
            "action": msg.action(),
            "tenant_id": msg.tenant_id,
            "priority": msg.priority,
        });
        let decision = match self
            .policy
            .evaluate(ctx, "acgs/bus/message", &policy_input)
            .await
        {
            Ok(decision) => decision,
            Err(error) => return StageResult::rejected(error, tags),
        };
        tags.extend(decision.tags.iter().cloned());
        let fingerprint = Some(decision.fingerprint.clone());
        if !decision.allowed() {
            return StageResult {
                outcome: ProcessOutcome::Rejected {
                    error: BusError::PolicyDenied {
                        violations: decision.violations.clone(),
                    },
                },
                fingerprint,
                score: None,
                lane: None,
                tags,
            };
        }
        if ctx.is_cancelled() {
            // The engine call already happened; record the late cancel.
            tags.push("cancelled_late".to_string());
            return StageResult {
                outcome: ProcessOutcome::Rejected {
                    error: BusError::CancelledLate,
                },
                fingerprint,
                score: None,
                lane: None,
                tags,
            };
        }

        // Stage 4: impact scoring. Not retried; falls back internally.
        let impact = self.scorer.score(ctx, msg).await;
        if impact.confidence == 0.0 {
            tags.push("score_fallback".to_string());
        }
        let score = Some(impact.score);

        // Stage 5: routing.
        let route = self.router.route(msg, impact.score);

        // Stage 6: dispatch.
        if let Err(error) = ctx.check() {
            return StageResult {
                outcome: ProcessOutcome::Rejected { error },
                fingerprint,
                score,
                lane: Some(route.lane),
                tags,
            };
        }
        let outcome = match route.lane {
            Lane::Fast => self.dispatch_fast(msg, &mut tags),
            Lane::Deliberation => self.enqueue_deliberation(msg, impact.score, route),
        };

        StageResult {
            outcome,
            fingerprint,
            score,
            lane: Some(route.lane),
            tags,
        }
    }

    fn dispatch_fast(&self, msg: &MessageEnvelope, tags: &mut Vec<String>) -> ProcessOutcome {
        if let Some(fault) = self.chaos.intercept("bus.dispatch") {
            tags.push("chaos_fault".to_string());
            return ProcessOutcome::Rejected {
                error: BusError::internal(fault.to_string()),
            };
        }
        match self.bus.deliver(msg.clone()) {
            Ok(()) => ProcessOutcome::Delivered,
            Err(error) => ProcessOutcome::Rejected { error },
        }
    }

    fn enqueue_deliberation(
        &self,
        msg: &MessageEnvelope,
        score: f64,
        route: RouteDecision,
    ) -> ProcessOutcome {
        let required_votes = if route.review.multi_vote {
            self.config.deliberation.required_votes
        } else {
            1
        };
        let reason = match route.reason {
            RouteReason::Score => "score",
            RouteReason::HighRiskAction => "high_risk_action",
            RouteReason::SensitiveContent => "sensitive_content",
            RouteReason::Forced => "forced",
            RouteReason::Benign => "benign",
        };
        let item = DeliberationItem::new(
            msg.clone(),
            score,
            reason,
            route.review.hitl,
            route.review.multi_vote,
            required_votes,
            route.review.deadline_secs,
        );
        match self.deliberations.enqueue(item) {
            Ok(item_id) => {
                self.metering
                    .record(UsageEvent::deliberation(&msg.tenant_id));
                ProcessOutcome::QueuedForDeliberation { item_id }
            }
            Err(error) => ProcessOutcome::Rejected { error },
        }
    }

    fn emit_audit(&self, msg: &MessageEnvelope, result: &StageResult) {
        let severity = match &result.outcome {
            ProcessOutcome::Rejected { error } => error.severity(),
            _ => acgs_core::error::Severity::Info,
        };
        let mut entry = AuditEntry::new(
            msg.message_id,
            result.outcome.decision_label(),
            self.config.constitutional_hash.clone(),
        )
        .with_severity(severity);
        if let Some(fingerprint) = &result.fingerprint {
            entry = entry.with_fingerprint(fingerprint.clone());
        }
        if let Some(score) = result.score {
            entry = entry.with_score(score);
        }
        if let Some(lane) = result.lane {
            entry = entry.with_lane(match lane {
                Lane::Fast => "fast",
                Lane::Deliberation => "deliberation",
            });
        }
        for tag in &result.tags {
            entry = entry.with_tag(tag.clone());
        }
        self.audit.emit(entry);
    }

    fn emit_metering(&self, msg: &MessageEnvelope, result: &StageResult) {
        let mut event = UsageEvent::message_processed(&msg.tenant_id)
            .with_property("outcome", result.outcome.decision_label());
        if let Some(score) = result.score {
            event = event.with_property("score", format!("{score:.3}"));
        }
        self.metering.record(event);
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            deliberated: self.deliberated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl StageResult {
    fn rejected(error: BusError, tags: Vec<String>) -> Self {
        Self {
            outcome: ProcessOutcome::Rejected { error },
            fingerprint: None,
            score: None,
            lane: None,
            tags,
        }
    }
}

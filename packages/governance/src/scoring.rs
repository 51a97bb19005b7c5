//! ACGS-Governance: Impact Scoring
//!
//! Produces a scalar governance-risk score in [0,1] per message from
//! three signals: semantic (black-box model over the content text),
//! permission (how privileged the attempted action is) and drift (how far
//! the sender has moved from its recent behavior). The model call runs
//! under a timeout; on expiry a neutral fallback keeps routing
//! deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use acgs_core::{BusError, MessageEnvelope, MessageType, ProcessContext, ScoringConfig};

use crate::router::HIGH_RISK_ACTIONS;

/// Black-box semantic risk model: text in, risk in [0,1] out.
#[async_trait]
pub trait ImpactModel: Send + Sync {
    async fn score(&self, text: &str) -> Result<f64, BusError>;

    /// Model identity; the scorer is idempotent per (content, version).
    fn version(&self) -> &str {
        "heuristic-v1"
    }
}

/// Default model: keyword heuristic, no external dependency.
pub struct KeywordModel {
    weighted_terms: Vec<(String, f64)>,
}

impl Default for KeywordModel {
    fn default() -> Self {
        Self {
            weighted_terms: vec![
                ("delete".to_string(), 0.4),
                ("terminate".to_string(), 0.5),
                ("override".to_string(), 0.6),
                ("constitution".to_string(), 0.7),
                ("credential".to_string(), 0.7),
                ("escalate".to_string(), 0.5),
                ("bypass".to_string(), 0.8),
            ],
        }
    }
}

#[async_trait]
impl ImpactModel for KeywordModel {
    async fn score(&self, text: &str) -> Result<f64, BusError> {
        let lowered = text.to_lowercase();
        let mut score: f64 = 0.0;
        for (term, weight) in &self.weighted_terms {
            if lowered.contains(term.as_str()) {
                score = score.max(*weight);
            }
        }
        Ok(score)
    }
}

/// Per-signal breakdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub semantic: f64,
    pub permission: f64,
    pub drift: f64,
}

/// The scorer's output; produced once per message, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactScore {
    pub message_id: Uuid,
    pub score: f64,
    pub components: ScoreComponents,
    pub confidence: f64,
}

impl ImpactScore {
    /// Neutral fallback applied when the model misses its budget.
    pub fn fallback(message_id: Uuid) -> Self {
        Self {
            message_id,
            score: 0.5,
            components: ScoreComponents {
                semantic: 0.5,
                permission: 0.0,
                drift: 0.0,
            },
            confidence: 0.0,
        }
    }
}

/// Tracks a per-agent semantic baseline (EMA) to derive the drift signal.
struct DriftTracker {
    baselines: HashMap<String, f64>,
    alpha: f64,
}

impl DriftTracker {
    fn new() -> Self {
        Self {
            baselines: HashMap::new(),
            alpha: 0.2,
        }
    }

    /// Drift = distance of this observation from the agent's baseline;
    /// updates the baseline afterwards.
    fn observe(&mut self, agent_id: &str, semantic: f64) -> f64 {
        match self.baselines.get_mut(agent_id) {
            Some(baseline) => {
                let drift = (semantic - *baseline).abs();
                *baseline = *baseline * (1.0 - self.alpha) + semantic * self.alpha;
                drift
            }
            None => {
                self.baselines.insert(agent_id.to_string(), semantic);
                0.0
            }
        }
    }
}

/// Impact scorer (C3).
pub struct ImpactScorer {
    model: Arc<dyn ImpactModel>,
    config: ScoringConfig,
    timeout: Duration,
    drift: Mutex<DriftTracker>,
}

impl ImpactScorer {
    pub fn new(model: Arc<dyn ImpactModel>, config: ScoringConfig, timeout: Duration) -> Self {
        Self {
            model,
            config,
            timeout,
            drift: Mutex::new(DriftTracker::new()),
        }
    }

    /// How privileged the attempted action is, independent of content.
    fn permission_signal(msg: &MessageEnvelope) -> f64 {
        if let Some(action) = msg.action() {
            if HIGH_RISK_ACTIONS.contains(&action) {
                return 1.0;
            }
        }
        match msg.message_type {
            MessageType::GovernanceRequest
            | MessageType::GovernanceResponse
            | MessageType::ConstitutionalValidation => 0.6,
            MessageType::Command | MessageType::TaskRequest => 0.4,
            _ => 0.1,
        }
    }

    /// Extra configured factors read from numeric content fields of the
    /// same name. Absent fields contribute zero.
    fn extra_signal(&self, msg: &MessageEnvelope) -> f64 {
        self.config
            .extra_factors
            .iter()
            .map(|(name, weight)| {
                let value = msg
                    .content
                    .get(name)
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                weight * value
            })
            .sum()
    }

    /// Score a message. Never fails: a model timeout or error yields the
    /// `score=0.5, confidence=0.0` fallback so routing stays
    /// deterministic.
    pub async fn score(&self, ctx: &ProcessContext, msg: &MessageEnvelope) -> ImpactScore {
        let budget = ctx.clamp(self.timeout);
        let text = msg.content_text();

        let semantic = match tokio::time::timeout(budget, self.model.score(&text)).await {
            Ok(Ok(value)) => value.clamp(0.0, 1.0),
            Ok(Err(err)) => {
                tracing::warn!(message_id = %msg.message_id, error = %err, "impact model error, using fallback");
                return ImpactScore::fallback(msg.message_id);
            }
            Err(_) => {
                tracing::warn!(message_id = %msg.message_id, "impact model timed out, using fallback");
                return ImpactScore::fallback(msg.message_id);
            }
        };

        let permission = Self::permission_signal(msg);
        let drift = self.drift.lock().observe(&msg.from_agent, semantic);

        let combined = self.config.semantic_weight * semantic
            + self.config.permission_weight * permission
            + self.config.drift_weight * drift
            + self.extra_signal(msg);

        ImpactScore {
            message_id: msg.message_id,
            score: combined.clamp(0.0, 1.0),
            components: ScoreComponents {
                semantic,
                permission,
                drift,
            },
            confidence: 1.0,
        }
    }
}

//! ACGS-Governance: Adaptive Router
//!
//! Pure, deterministic lane choice per (message, score, flags). High-risk
//! actions, sensitive content and explicit force flags always deliberate;
//! everything else splits on the impact threshold. Ties break in favor of
//! deliberation.

use serde::{Deserialize, Serialize};

use acgs_core::{DeliberationConfig, MessageEnvelope, RoutingConfig};

/// Actions that always take the deliberation lane.
pub const HIGH_RISK_ACTIONS: [&str; 8] = [
    "constitutional_update",
    "policy_change",
    "agent_termination",
    "security_override",
    "audit_log_access",
    "system_configuration_change",
    "credential_rotation",
    "tenant_migration",
];

/// Which path a message takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Fast,
    Deliberation,
}

/// Why the router chose the lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    Benign,
    Score,
    HighRiskAction,
    SensitiveContent,
    Forced,
}

/// Review shape for a deliberation item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequirements {
    pub hitl: bool,
    pub multi_vote: bool,
    pub deadline_secs: u64,
}

/// The routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub lane: Lane,
    pub reason: RouteReason,
    pub review: ReviewRequirements,
}

/// Adaptive router (C11).
pub struct AdaptiveRouter {
    routing: RoutingConfig,
    deliberation: DeliberationConfig,
}

impl AdaptiveRouter {
    pub fn new(routing: RoutingConfig, deliberation: DeliberationConfig) -> Self {
        Self {
            routing,
            deliberation,
        }
    }

    fn is_high_risk_action(msg: &MessageEnvelope) -> bool {
        msg.action()
            .map(|a| HIGH_RISK_ACTIONS.contains(&a))
            .unwrap_or(false)
    }

    fn has_sensitive_content(&self, msg: &MessageEnvelope) -> bool {
        let text = msg.content_text().to_lowercase();
        self.routing
            .sensitive_keywords
            .iter()
            .any(|kw| text.contains(kw.as_str()))
    }

    /// Review tier from the score bands: >= multi_vote gets HITL plus a
    /// multi-agent vote; >= hitl gets human review; the base deliberation
    /// band reviews without either.
    fn tier_for_score(&self, score: f64) -> ReviewRequirements {
        if score >= self.routing.multi_vote_threshold {
            ReviewRequirements {
                hitl: true,
                multi_vote: true,
                deadline_secs: self.deliberation.vote_deadline_secs,
            }
        } else if score >= self.routing.hitl_threshold {
            ReviewRequirements {
                hitl: true,
                multi_vote: false,
                deadline_secs: self.deliberation.review_deadline_secs,
            }
        } else {
            ReviewRequirements {
                hitl: false,
                multi_vote: false,
                deadline_secs: self.deliberation.review_deadline_secs,
            }
        }
    }

    /// The top tier, applied whenever a risk flag (not the score) forced
    /// deliberation.
    fn top_tier(&self) -> ReviewRequirements {
        ReviewRequirements {
            hitl: true,
            multi_vote: true,
            deadline_secs: self.deliberation.vote_deadline_secs,
        }
    }

    /// Decide the lane. Pure function of its inputs.
    pub fn route(&self, msg: &MessageEnvelope, score: f64) -> RouteDecision {
        if msg.force_deliberation() {
            return RouteDecision {
                lane: Lane::Deliberation,
                reason: RouteReason::Forced,
                review: self.top_tier(),
            };
        }
        if Self::is_high_risk_action(msg) {
            return RouteDecision {
                lane: Lane::Deliberation,
                reason: RouteReason::HighRiskAction,
                review: self.top_tier(),
            };
        }
        if self.has_sensitive_content(msg) {
            return RouteDecision {
                lane: Lane::Deliberation,
                reason: RouteReason::SensitiveContent,
                review: self.top_tier(),
            };
        }
        // Lower-closed boundary: exactly the threshold deliberates
        if score >= self.routing.impact_threshold {
            return RouteDecision {
                lane: Lane::Deliberation,
                reason: RouteReason::Score,
                review: self.tier_for_score(score),
            };
        }
        RouteDecision {
            lane: Lane::Fast,
            reason: RouteReason::Benign,
            review: ReviewRequirements {
                hitl: false,
                multi_vote: false,
                deadline_secs: self.deliberation.fast_budget_secs,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::MessageType;

    const HASH: &str = "cdd01ef066bc6cf2";

    fn router() -> AdaptiveRouter {
        AdaptiveRouter::new(RoutingConfig::default(), DeliberationConfig::default())
    }

    fn msg() -> MessageEnvelope {
        MessageEnvelope::new("exec-1", "jud-1", MessageType::Query, HASH)
    }

    #[test]
    fn test_benign_low_score_goes_fast() {
        let decision = router().route(&msg(), 0.3);
        assert_eq!(decision.lane, Lane::Fast);
        assert_eq!(decision.reason, RouteReason::Benign);
        assert_eq!(decision.review.deadline_secs, 30);
    }

    #[test]
    fn test_exact_threshold_deliberates() {
        // 0.80 is lower-closed on the deliberation side
        let decision = router().route(&msg(), 0.80);
        assert_eq!(decision.lane, Lane::Deliberation);
        assert!(!decision.review.hitl);
        assert!(!decision.review.multi_vote);

        let below = router().route(&msg(), 0.7999);
        assert_eq!(below.lane, Lane::Fast);
    }

    #[test]
    fn test_hitl_band() {
        let decision = router().route(&msg(), 0.90);
        assert!(decision.review.hitl);
        assert!(!decision.review.multi_vote);
        assert_eq!(decision.review.deadline_secs, 300);

        let under = router().route(&msg(), 0.89);
        assert!(!under.review.hitl);
    }

    #[test]
    fn test_multi_vote_band() {
        let decision = router().route(&msg(), 0.95);
        assert!(decision.review.hitl);
        assert!(decision.review.multi_vote);
        assert_eq!(decision.review.deadline_secs, 600);
    }

    #[test]
    fn test_high_risk_action_forces_top_tier() {
        let msg = msg().with_action("policy_change");
        let decision = router().route(&msg, 0.1);
        assert_eq!(decision.lane, Lane::Deliberation);
        assert_eq!(decision.reason, RouteReason::HighRiskAction);
        assert!(decision.review.hitl);
        assert!(decision.review.multi_vote);
    }

    #[test]
    fn test_every_high_risk_action_deliberates() {
        for action in HIGH_RISK_ACTIONS {
            let msg = msg().with_action(action);
            assert_eq!(
                router().route(&msg, 0.0).lane,
                Lane::Deliberation,
                "{action} must deliberate"
            );
        }
    }

    #[test]
    fn test_sensitive_content_deliberates() {
        let msg = msg().with_content("text", serde_json::json!("initiate wire_transfer now"));
        let decision = router().route(&msg, 0.1);
        assert_eq!(decision.lane, Lane::Deliberation);
        assert_eq!(decision.reason, RouteReason::SensitiveContent);
    }

    #[test]
    fn test_force_flag_wins() {
        let msg = msg().with_content("force_deliberation", serde_json::json!(true));
        let decision = router().route(&msg, 0.0);
        assert_eq!(decision.lane, Lane::Deliberation);
        assert_eq!(decision.reason, RouteReason::Forced);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let msg = msg().with_content("text", serde_json::json!("hello"));
        let a = router().route(&msg, 0.85);
        let b = router().route(&msg, 0.85);
        assert_eq!(a, b);
    }
}

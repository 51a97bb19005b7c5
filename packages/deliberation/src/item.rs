//! ACGS-Deliberation: Deliberation Items
//!
//! One item per message routed to the slow lane. State is monotonic along
//! pending -> in_review -> {approved | rejected | timeout}; no transition
//! ever moves backwards. The full envelope is retained so an approved
//! item can still be delivered.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acgs_core::{BusError, MessageEnvelope, Priority, Role};

/// Review lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationState {
    Pending,
    InReview,
    Approved,
    Rejected,
    Timeout,
}

impl DeliberationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Timeout)
    }

    /// Monotonic transition check.
    pub fn can_transition(&self, to: DeliberationState) -> bool {
        match (self, to) {
            (Self::Pending, Self::InReview) => true,
            (Self::Pending | Self::InReview, Self::Approved) => true,
            (Self::Pending | Self::InReview, Self::Rejected) => true,
            (Self::Pending | Self::InReview, Self::Timeout) => true,
            _ => false,
        }
    }
}

/// One critic's vote, keyed by agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub role: Role,
    pub approve: bool,
    /// Opaque signature from the critic's signer
    pub signature: String,
    pub cast_at: DateTime<Utc>,
}

/// One human reviewer's decision, keyed by reviewer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanReview {
    pub reviewer_id: String,
    pub approve: bool,
    pub decided_at: DateTime<Utc>,
}

/// A message parked for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationItem {
    pub item_id: Uuid,
    /// Retained envelope, delivered on approval
    pub message: MessageEnvelope,
    pub impact_score: f64,
    /// Why the router sent it here ("score", "high_risk_action", ...)
    pub reason: String,
    pub hitl_required: bool,
    pub multi_vote_required: bool,
    /// Approvals needed (1 unless multi-vote)
    pub required_votes: u32,
    pub votes: Vec<Vote>,
    pub human_reviews: Vec<HumanReview>,
    pub state: DeliberationState,
    /// Whether the HITL notifier has acknowledged delivery
    pub notified: bool,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl DeliberationItem {
    pub fn new(
        message: MessageEnvelope,
        impact_score: f64,
        reason: impl Into<String>,
        hitl_required: bool,
        multi_vote_required: bool,
        required_votes: u32,
        deadline_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            item_id: Uuid::new_v4(),
            message,
            impact_score,
            reason: reason.into(),
            hitl_required,
            multi_vote_required,
            required_votes: required_votes.max(1),
            votes: Vec::new(),
            human_reviews: Vec::new(),
            state: DeliberationState::Pending,
            notified: false,
            enqueued_at: now,
            deadline: now + Duration::seconds(deadline_secs as i64),
            decided_at: None,
        }
    }

    /// Message priority is the queue tier.
    pub fn tier(&self) -> Priority {
        self.message.priority
    }

    /// Enforced monotonic transition.
    pub fn transition(&mut self, to: DeliberationState) -> Result<(), BusError> {
        if !self.state.can_transition(to) {
            return Err(BusError::internal(format!(
                "illegal deliberation transition {:?} -> {:?}",
                self.state, to
            )));
        }
        self.state = to;
        if to.is_terminal() {
            self.decided_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now >= self.deadline
    }

    fn approvals(&self) -> u32 {
        self.votes.iter().filter(|v| v.approve).count() as u32
    }

    fn rejects(&self) -> u32 {
        self.votes.iter().filter(|v| !v.approve).count() as u32
    }

    fn judicial_veto(&self) -> bool {
        self.votes
            .iter()
            .any(|v| !v.approve && v.role == Role::Judicial)
    }

    fn human_approved(&self) -> bool {
        self.human_reviews.iter().any(|r| r.approve)
    }

    fn human_rejected(&self) -> bool {
        self.human_reviews.iter().any(|r| !r.approve)
    }

    /// Fold the collected votes and reviews into a terminal state, if the
    /// evidence is sufficient. `total_critics` is the size of the critic
    /// pool consulted for multi-vote items.
    pub fn evaluate(&self, total_critics: u32) -> Option<DeliberationState> {
        // A human reject ends the item regardless of votes.
        if self.human_rejected() {
            return Some(DeliberationState::Rejected);
        }
        // A Judicial reject vetoes any approval.
        if self.rejects() > total_critics.saturating_sub(self.required_votes) {
            return Some(DeliberationState::Rejected);
        }
        let votes_ok = self.approvals() >= self.required_votes && !self.judicial_veto();
        let hitl_ok = !self.hitl_required || self.human_approved();
        let needs_votes = self.multi_vote_required || !self.votes.is_empty() || !self.hitl_required;
        if hitl_ok && (!needs_votes || votes_ok) {
            return Some(DeliberationState::Approved);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::MessageType;

    const HASH: &str = "cdd01ef066bc6cf2";

    fn item(hitl: bool, multi: bool, required: u32) -> DeliberationItem {
        let msg = MessageEnvelope::new("exec-1", "jud-1", MessageType::Command, HASH);
        DeliberationItem::new(msg, 0.96, "score", hitl, multi, required, 600)
    }

    fn vote(agent: &str, role: Role, approve: bool) -> Vote {
        Vote {
            agent_id: agent.to_string(),
            role,
            approve,
            signature: format!("sig-{agent}"),
            cast_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_monotonic() {
        assert!(DeliberationState::Pending.can_transition(DeliberationState::InReview));
        assert!(DeliberationState::InReview.can_transition(DeliberationState::Approved));
        assert!(!DeliberationState::Approved.can_transition(DeliberationState::Rejected));
        assert!(!DeliberationState::InReview.can_transition(DeliberationState::Pending));
        assert!(!DeliberationState::Timeout.can_transition(DeliberationState::InReview));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut item = item(false, false, 1);
        item.transition(DeliberationState::Approved).unwrap();
        assert!(item.transition(DeliberationState::Rejected).is_err());
    }

    #[test]
    fn test_vote_only_item_approves_on_quorum() {
        let mut item = item(false, true, 2);
        item.votes.push(vote("jud-1", Role::Judicial, true));
        assert_eq!(item.evaluate(3), None);
        item.votes.push(vote("jud-2", Role::Judicial, true));
        assert_eq!(item.evaluate(3), Some(DeliberationState::Approved));
    }

    #[test]
    fn test_judicial_veto_blocks_approval() {
        let mut item = item(false, true, 2);
        item.votes.push(vote("exec-2", Role::Executive, true));
        item.votes.push(vote("leg-1", Role::Legislative, true));
        item.votes.push(vote("jud-1", Role::Judicial, false));
        // Quorum reached but the Judicial reject vetoes
        assert_ne!(item.evaluate(4), Some(DeliberationState::Approved));
    }

    #[test]
    fn test_reject_majority() {
        let mut item = item(false, true, 2);
        item.votes.push(vote("a", Role::Executive, false));
        item.votes.push(vote("b", Role::Legislative, false));
        // rejects (2) > total_critics (3) - required (2)
        assert_eq!(item.evaluate(3), Some(DeliberationState::Rejected));
    }

    #[test]
    fn test_hitl_and_votes_both_required() {
        let mut item = item(true, true, 2);
        item.votes.push(vote("jud-1", Role::Judicial, true));
        item.votes.push(vote("jud-2", Role::Judicial, true));
        // Votes satisfied, human review still missing
        assert_eq!(item.evaluate(3), None);

        item.human_reviews.push(HumanReview {
            reviewer_id: "alice".into(),
            approve: true,
            decided_at: Utc::now(),
        });
        assert_eq!(item.evaluate(3), Some(DeliberationState::Approved));
    }

    #[test]
    fn test_hitl_only_item() {
        let mut item = item(true, false, 1);
        assert_eq!(item.evaluate(3), None);
        item.human_reviews.push(HumanReview {
            reviewer_id: "alice".into(),
            approve: true,
            decided_at: Utc::now(),
        });
        assert_eq!(item.evaluate(3), Some(DeliberationState::Approved));
    }

    #[test]
    fn test_human_reject_ends_item() {
        let mut item = item(true, true, 2);
        item.votes.push(vote("jud-1", Role::Judicial, true));
        item.human_reviews.push(HumanReview {
            reviewer_id: "alice".into(),
            approve: false,
            decided_at: Utc::now(),
        });
        assert_eq!(item.evaluate(3), Some(DeliberationState::Rejected));
    }

    #[test]
    fn test_expiry() {
        let mut item = item(false, false, 1);
        assert!(!item.is_expired(Utc::now()));
        assert!(item.is_expired(Utc::now() + Duration::seconds(601)));
        item.transition(DeliberationState::Approved).unwrap();
        assert!(!item.is_expired(Utc::now() + Duration::seconds(601)));
    }
}

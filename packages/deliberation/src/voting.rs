//! ACGS-Deliberation: Voting Service
//!
//! Collects critic votes for deliberation items. One vote per agent; a
//! duplicate replaces the prior vote only while the item is still
//! pending. Approval needs the required quorum with no Judicial reject;
//! rejection fires once enough of the critic pool has voted against.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use acgs_core::{BusError, Role};

use crate::item::{DeliberationItem, DeliberationState, Vote};
use crate::queue::DeliberationQueue;

/// Result of casting a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    /// Vote recorded, item still open
    Open,
    /// Vote recorded and the item reached a terminal state
    Decided(DeliberationState),
    /// Duplicate vote ignored (item already in review)
    Ignored,
}

/// Digest over the collected votes, anchored in the audit record.
pub fn votes_digest(item: &DeliberationItem) -> String {
    let mut entries: Vec<(String, bool)> = item
        .votes
        .iter()
        .map(|v| (v.agent_id.clone(), v.approve))
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (agent_id, approve) in entries {
        hasher.update(agent_id.as_bytes());
        hasher.update([u8::from(approve)]);
    }
    for review in &item.human_reviews {
        hasher.update(review.reviewer_id.as_bytes());
        hasher.update([u8::from(review.approve)]);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Voting service (C9).
pub struct VotingService {
    queue: Arc<DeliberationQueue>,
    total_critics: u32,
}

impl VotingService {
    pub fn new(queue: Arc<DeliberationQueue>, total_critics: u32) -> Self {
        Self {
            queue,
            total_critics: total_critics.max(1),
        }
    }

    /// Cast (or, while pending, replace) a critic's vote and re-tally.
    pub fn vote(
        &self,
        item_id: Uuid,
        agent_id: &str,
        role: Role,
        approve: bool,
        signature: impl Into<String>,
    ) -> Result<TallyOutcome, BusError> {
        let total_critics = self.total_critics;
        let signature = signature.into();
        let agent = agent_id.to_string();
        self.queue.with_item(item_id, move |item| {
            if item.state.is_terminal() {
                return Err(BusError::internal(format!(
                    "vote on decided item {item_id}"
                )));
            }

            let existing = item.votes.iter().position(|v| v.agent_id == agent);
            match (existing, item.state) {
                (Some(pos), DeliberationState::Pending) => {
                    // Replacement is only allowed while pending
                    item.votes[pos] = Vote {
                        agent_id: agent.clone(),
                        role,
                        approve,
                        signature,
                        cast_at: Utc::now(),
                    };
                }
                (Some(_), _) => return Ok(TallyOutcome::Ignored),
                (None, _) => {
                    item.votes.push(Vote {
                        agent_id: agent.clone(),
                        role,
                        approve,
                        signature,
                        cast_at: Utc::now(),
                    });
                }
            }

            if item.state == DeliberationState::Pending {
                item.transition(DeliberationState::InReview)?;
            }

            match item.evaluate(total_critics) {
                Some(terminal) => {
                    item.transition(terminal)?;
                    tracing::info!(
                        item_id = %item_id,
                        outcome = ?terminal,
                        votes = item.votes.len(),
                        "deliberation item decided by vote"
                    );
                    Ok(TallyOutcome::Decided(terminal))
                }
                None => Ok(TallyOutcome::Open),
            }
        })
    }
}

//! ACGS-Deliberation: Human-in-the-Loop
//!
//! Surfaces pending items to an external notifier (at-least-once) and
//! accepts asynchronous reviewer callbacks. Callbacks are idempotent on
//! (item_id, reviewer_id): a repeated decision from the same reviewer
//! collapses to the first one.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use acgs_core::BusError;

use crate::item::{DeliberationItem, DeliberationState, HumanReview};
use crate::queue::DeliberationQueue;

/// External reviewer channel. Delivery is at-least-once: a failed notify
/// leaves the item un-notified and the next dispatch retries it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, item: &DeliberationItem) -> Result<(), BusError>;
}

/// Webhook notifier posting the pending item as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    headers: Vec<(String, String)>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, item: &DeliberationItem) -> Result<(), BusError> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "item_id": item.item_id,
            "message_id": item.message.message_id,
            "impact_score": item.impact_score,
            "reason": item.reason,
            "deadline": item.deadline,
        }));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BusError::internal(format!("notifier transport: {e}")))?;
        if !response.status().is_success() {
            return Err(BusError::internal(format!(
                "notifier status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// HITL manager (C10).
pub struct HitlManager {
    queue: Arc<DeliberationQueue>,
    notifier: Arc<dyn Notifier>,
    total_critics: u32,
}

impl HitlManager {
    pub fn new(
        queue: Arc<DeliberationQueue>,
        notifier: Arc<dyn Notifier>,
        total_critics: u32,
    ) -> Self {
        Self {
            queue,
            notifier,
            total_critics: total_critics.max(1),
        }
    }

    /// Notify reviewers of every HITL item not yet acknowledged. Returns
    /// how many notifications went out.
    pub async fn dispatch_pending(&self) -> usize {
        let mut sent = 0;
        for item in self.queue.open_items() {
            if !item.hitl_required || item.notified {
                continue;
            }
            match self.notifier.notify(&item).await {
                Ok(()) => {
                    let marked = self.queue.with_item(item.item_id, |item| {
                        item.notified = true;
                        if item.state == DeliberationState::Pending {
                            item.transition(DeliberationState::InReview)?;
                        }
                        Ok(())
                    });
                    if marked.is_ok() {
                        sent += 1;
                    }
                }
                Err(err) => {
                    // At-least-once: stay un-notified and retry next pass
                    tracing::warn!(item_id = %item.item_id, error = %err, "HITL notify failed");
                }
            }
        }
        sent
    }

    /// Reviewer callback. Idempotent per (item_id, reviewer_id); returns
    /// the item's state after folding the decision in.
    pub fn callback(
        &self,
        item_id: Uuid,
        reviewer_id: &str,
        approve: bool,
    ) -> Result<DeliberationState, BusError> {
        let total_critics = self.total_critics;
        let reviewer = reviewer_id.to_string();
        self.queue.with_item(item_id, move |item| {
            if item.state.is_terminal() {
                return Ok(item.state);
            }

            if item
                .human_reviews
                .iter()
                .any(|r| r.reviewer_id == reviewer)
            {
                // Duplicate callback: first decision stands
                return Ok(item.state);
            }

            item.human_reviews.push(HumanReview {
                reviewer_id: reviewer.clone(),
                approve,
                decided_at: Utc::now(),
            });
            if item.state == DeliberationState::Pending {
                item.transition(DeliberationState::InReview)?;
            }

            if let Some(terminal) = item.evaluate(total_critics) {
                item.transition(terminal)?;
                tracing::info!(
                    item_id = %item_id,
                    reviewer = %reviewer,
                    outcome = ?terminal,
                    "deliberation item decided by review"
                );
            }
            Ok(item.state)
        })
    }
}

//! ACGS-Core: Message Envelope
//!
//! Wire-agnostic envelope every message on the bus carries. The envelope is
//! immutable after acceptance; downstream stages read it, they never write
//! back into it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Message variants the bus brokers. Closed set: unknown variants are
/// rejected at deserialization, not coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Query,
    Response,
    Event,
    Notification,
    Heartbeat,
    GovernanceRequest,
    GovernanceResponse,
    ConstitutionalValidation,
    TaskRequest,
    TaskResponse,
}

impl MessageType {
    /// Human-readable name used in audit records and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Query => "query",
            Self::Response => "response",
            Self::Event => "event",
            Self::Notification => "notification",
            Self::Heartbeat => "heartbeat",
            Self::GovernanceRequest => "governance_request",
            Self::GovernanceResponse => "governance_response",
            Self::ConstitutionalValidation => "constitutional_validation",
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
        }
    }
}

/// Delivery priority. Lower rank preempts higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank: CRITICAL=0, HIGH=1, NORMAL=2, LOW=3.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Critical sorts first
        self.rank().cmp(&other.rank())
    }
}

/// The message envelope.
///
/// `message_id` is a UUIDv7 so ids are monotonic-time-prefixed and sortable
/// by creation time. `conversation_id` groups a logical exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID (UUIDv7)
    pub message_id: Uuid,
    /// Conversation this message belongs to
    pub conversation_id: Uuid,
    /// Sending agent ID
    pub from_agent: String,
    /// Receiving agent ID, or topic name for fan-out
    pub to_agent: String,
    /// Message variant
    pub message_type: MessageType,
    /// Delivery priority
    pub priority: Priority,
    /// Tenant the message belongs to
    pub tenant_id: String,
    /// Constitutional hash the sender claims (16 lowercase hex chars)
    pub constitutional_hash: String,
    /// Free-form content map
    pub content: HashMap<String, serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Create a new envelope. Timestamps are set to now and the
    /// conversation ID is fresh; override with the builder methods.
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        message_type: MessageType,
        constitutional_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: Uuid::now_v7(),
            conversation_id: Uuid::new_v4(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            message_type,
            priority: Priority::Normal,
            tenant_id: "default".to_string(),
            constitutional_hash: constitutional_hash.into(),
            content: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the conversation ID.
    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Add a content entry.
    pub fn with_content(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.content.insert(key.into(), value);
        self
    }

    /// Set the attempted action (`content.action`).
    pub fn with_action(self, action: &str) -> Self {
        self.with_content("action", serde_json::Value::String(action.to_string()))
    }

    /// The attempted action, if the content names one.
    pub fn action(&self) -> Option<&str> {
        self.content.get("action").and_then(|v| v.as_str())
    }

    /// Whether the sender forced the deliberation lane.
    pub fn force_deliberation(&self) -> bool {
        self.content
            .get("force_deliberation")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Concatenated textual content, fed to the impact scorer.
    pub fn content_text(&self) -> String {
        let mut keys: Vec<&String> = self.content.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            if let Some(text) = self.content.get(key).and_then(|v| v.as_str()) {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Routing key for per-pair FIFO ordering.
    pub fn pair_key(&self) -> (String, String) {
        (self.from_agent.clone(), self.to_agent.clone())
    }
}

//! ACGS-Core: Agent Records
//!
//! Registry-facing view of an agent: identity, lifecycle status and its
//! trias-politica role. Role changes only happen through a privileged
//! `role_transition` event, never as a side effect of traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::message::MessageType;

/// Three-branch (trias politica) role separation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Proposes and synthesizes work
    Executive,
    /// Extracts rules and synthesizes policy
    Legislative,
    /// Validates and audits; carries veto weight in voting
    Judicial,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Executive => "executive",
            Self::Legislative => "legislative",
            Self::Judicial => "judicial",
        }
    }
}

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered but not yet started
    Registered,
    /// Actively sending/receiving
    Active,
    /// Finishing in-flight work, no new messages accepted
    Draining,
    /// Suspended: heartbeats only
    Suspended,
    /// Gone
    Terminated,
}

/// An agent known to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent ID
    pub agent_id: String,
    /// Free-form type label ("critic", "synthesizer", ...)
    pub agent_type: String,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Trias-politica role
    pub role: Role,
    /// Tenant the agent belongs to
    pub tenant_id: String,
    /// Declared capabilities
    pub capabilities: HashSet<String>,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Last time the bus saw traffic from this agent
    pub last_seen_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create a new record in `Registered` status.
    pub fn new(agent_id: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            agent_type: "generic".to_string(),
            status: AgentStatus::Registered,
            role,
            tenant_id: "default".to_string(),
            capabilities: HashSet::new(),
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Set the agent type.
    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Add a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Whether this agent may originate or receive the given message type.
    /// Suspended agents carry heartbeats only; draining and terminated
    /// agents carry nothing new.
    pub fn admits(&self, message_type: MessageType) -> bool {
        match self.status {
            AgentStatus::Registered | AgentStatus::Active => true,
            AgentStatus::Suspended => message_type == MessageType::Heartbeat,
            AgentStatus::Draining | AgentStatus::Terminated => false,
        }
    }

    /// Refresh `last_seen_at`.
    pub fn touch(&mut self) {
        self.last_seen_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_admits_traffic() {
        let agent = AgentRecord::new("exec-1", Role::Executive);
        assert_eq!(agent.status, AgentStatus::Registered);
        assert!(agent.admits(MessageType::Query));
        assert!(agent.admits(MessageType::Heartbeat));
    }

    #[test]
    fn test_suspended_agent_heartbeat_only() {
        let mut agent = AgentRecord::new("exec-1", Role::Executive);
        agent.status = AgentStatus::Suspended;
        assert!(agent.admits(MessageType::Heartbeat));
        assert!(!agent.admits(MessageType::Query));
        assert!(!agent.admits(MessageType::Command));
    }

    #[test]
    fn test_terminated_agent_admits_nothing() {
        let mut agent = AgentRecord::new("jud-1", Role::Judicial);
        agent.status = AgentStatus::Terminated;
        assert!(!agent.admits(MessageType::Heartbeat));
    }

    #[test]
    fn test_builder() {
        let agent = AgentRecord::new("leg-1", Role::Legislative)
            .with_type("rule-extractor")
            .with_tenant("tenant-b")
            .with_capability("extract_rules");
        assert_eq!(agent.agent_type, "rule-extractor");
        assert!(agent.capabilities.contains("extract_rules"));
    }
}

//! ACGS-Governance: MACI Role Separation
//!
//! Trias-politica action authorization. Each branch holds a fixed
//! allow-set; the table is immutable at runtime and role changes happen
//! only through a privileged `role_transition` event.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use acgs_core::{BusError, MessageType, Role};

/// Closed set of governed actions. Unknown action names never coerce into
/// a variant; they fall back to the message-type mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaciAction {
    Propose,
    Synthesize,
    Query,
    ExtractRules,
    Validate,
    Audit,
}

impl MaciAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Propose => "PROPOSE",
            Self::Synthesize => "SYNTHESIZE",
            Self::Query => "QUERY",
            Self::ExtractRules => "EXTRACT_RULES",
            Self::Validate => "VALIDATE",
            Self::Audit => "AUDIT",
        }
    }

    /// Parse an explicit action name, case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PROPOSE" => Some(Self::Propose),
            "SYNTHESIZE" => Some(Self::Synthesize),
            "QUERY" => Some(Self::Query),
            "EXTRACT_RULES" => Some(Self::ExtractRules),
            "VALIDATE" => Some(Self::Validate),
            "AUDIT" => Some(Self::Audit),
            _ => None,
        }
    }

    /// Derive the attempted action from the envelope: an explicit
    /// `content.action` naming a MACI action wins, otherwise the message
    /// type maps through a fixed table.
    pub fn derive(message_type: MessageType, content_action: Option<&str>) -> Self {
        if let Some(action) = content_action.and_then(Self::parse) {
            return action;
        }
        match message_type {
            MessageType::Command | MessageType::GovernanceRequest | MessageType::TaskRequest => {
                Self::Propose
            }
            MessageType::GovernanceResponse => Self::Synthesize,
            MessageType::ConstitutionalValidation => Self::Validate,
            MessageType::Query
            | MessageType::Response
            | MessageType::Event
            | MessageType::Notification
            | MessageType::Heartbeat
            | MessageType::TaskResponse => Self::Query,
        }
    }

    /// The allow-set for a branch. Immutable at runtime.
    pub fn allowed_for(role: Role) -> &'static [MaciAction] {
        match role {
            Role::Executive => &[Self::Propose, Self::Synthesize, Self::Query],
            Role::Legislative => &[Self::ExtractRules, Self::Synthesize, Self::Query],
            Role::Judicial => &[Self::Validate, Self::Audit, Self::Query],
        }
    }
}

/// In-memory agent-id -> role mapping with strict/loose admission.
pub struct RoleRegistry {
    entries: RwLock<HashMap<String, Role>>,
    strict: bool,
    default_role: Role,
}

impl RoleRegistry {
    /// Strict registry: unregistered agents are denied.
    pub fn strict() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            strict: true,
            default_role: Role::Executive,
        }
    }

    /// Loose registry: unregistered agents default to `default_role`.
    /// Strict is the production recommendation.
    pub fn loose(default_role: Role) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            strict: false,
            default_role,
        }
    }

    /// Register an agent's role. First assignment only; later changes go
    /// through `role_transition`.
    pub fn assign(&self, agent_id: impl Into<String>, role: Role) {
        self.entries.write().entry(agent_id.into()).or_insert(role);
    }

    /// Privileged role change. Out-of-band operational event; logged with
    /// the authorizing principal.
    pub fn role_transition(
        &self,
        agent_id: &str,
        new_role: Role,
        authorized_by: &str,
    ) -> Result<(), BusError> {
        let mut entries = self.entries.write();
        match entries.get_mut(agent_id) {
            Some(role) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    from = role.name(),
                    to = new_role.name(),
                    authorized_by = %authorized_by,
                    "role transition"
                );
                *role = new_role;
                Ok(())
            }
            None => Err(BusError::internal(format!(
                "role transition for unknown agent {agent_id}"
            ))),
        }
    }

    /// Replace the whole table (configuration reload). Writes are
    /// serialized behind the lock; readers see either table, never a mix.
    pub fn reload(&self, entries: HashMap<String, Role>) {
        *self.entries.write() = entries;
    }

    pub fn role_of(&self, agent_id: &str) -> Option<Role> {
        let known = self.entries.read().get(agent_id).copied();
        match (known, self.strict) {
            (Some(role), _) => Some(role),
            (None, true) => None,
            (None, false) => Some(self.default_role),
        }
    }

    /// Authorize an attempted action. Denies unknown agents in strict
    /// mode; otherwise checks the branch allow-set.
    pub fn authorize(&self, agent_id: &str, action: MaciAction) -> Result<(), BusError> {
        let Some(role) = self.role_of(agent_id) else {
            return Err(BusError::RoleViolation {
                agent_id: agent_id.to_string(),
                action: action.name().to_string(),
            });
        };
        if MaciAction::allowed_for(role).contains(&action) {
            Ok(())
        } else {
            Err(BusError::RoleViolation {
                agent_id: agent_id.to_string(),
                action: action.name().to_string(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_sets() {
        assert!(MaciAction::allowed_for(Role::Executive).contains(&MaciAction::Propose));
        assert!(!MaciAction::allowed_for(Role::Executive).contains(&MaciAction::Validate));
        assert!(MaciAction::allowed_for(Role::Legislative).contains(&MaciAction::ExtractRules));
        assert!(MaciAction::allowed_for(Role::Judicial).contains(&MaciAction::Audit));
        // QUERY is common to all three branches
        for role in [Role::Executive, Role::Legislative, Role::Judicial] {
            assert!(MaciAction::allowed_for(role).contains(&MaciAction::Query));
        }
    }

    #[test]
    fn test_derive_prefers_explicit_action() {
        let action = MaciAction::derive(MessageType::Command, Some("audit"));
        assert_eq!(action, MaciAction::Audit);
    }

    #[test]
    fn test_derive_falls_back_to_message_type() {
        assert_eq!(
            MaciAction::derive(MessageType::ConstitutionalValidation, None),
            MaciAction::Validate
        );
        assert_eq!(MaciAction::derive(MessageType::Query, None), MaciAction::Query);
        // Domain actions are routing inputs, not MACI actions
        assert_eq!(
            MaciAction::derive(MessageType::Command, Some("policy_change")),
            MaciAction::Propose
        );
    }

    #[test]
    fn test_strict_denies_unknown() {
        let registry = RoleRegistry::strict();
        assert!(registry.authorize("ghost", MaciAction::Query).is_err());
    }

    #[test]
    fn test_loose_defaults_role() {
        let registry = RoleRegistry::loose(Role::Executive);
        assert!(registry.authorize("ghost", MaciAction::Propose).is_ok());
        assert!(registry.authorize("ghost", MaciAction::Validate).is_err());
    }

    #[test]
    fn test_executive_cannot_validate() {
        let registry = RoleRegistry::strict();
        registry.assign("exec-1", Role::Executive);
        let err = registry
            .authorize("exec-1", MaciAction::Validate)
            .unwrap_err();
        assert!(matches!(err, BusError::RoleViolation { .. }));
    }

    #[test]
    fn test_assign_does_not_overwrite() {
        let registry = RoleRegistry::strict();
        registry.assign("a-1", Role::Executive);
        registry.assign("a-1", Role::Judicial);
        assert_eq!(registry.role_of("a-1"), Some(Role::Executive));
    }

    #[test]
    fn test_role_transition() {
        let registry = RoleRegistry::strict();
        registry.assign("a-1", Role::Executive);
        registry
            .role_transition("a-1", Role::Judicial, "operator:root")
            .unwrap();
        assert_eq!(registry.role_of("a-1"), Some(Role::Judicial));
        assert!(registry
            .role_transition("ghost", Role::Judicial, "operator:root")
            .is_err());
    }
}

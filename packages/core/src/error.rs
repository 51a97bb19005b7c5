//! ACGS-Core: Error Contract
//!
//! The stable set of error kinds every pipeline stage returns. Stages never
//! swallow errors; they propagate typed kinds to the processor, which maps
//! them to the terminal outcome. Senders see these kinds, never panics.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Audit severity attached to a terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Elevated,
    Critical,
}

/// Typed error kinds crossing stage boundaries.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusError {
    /// The message's hash does not match the canonical constitutional hash.
    #[error("constitutional hash mismatch: expected {expected}, got {actual}")]
    ConstitutionalHashMismatch { expected: String, actual: String },

    /// Envelope missing required fields or carrying inconsistent ones.
    #[error("malformed message: {reason}")]
    MessageMalformed { reason: String },

    /// The sending agent's role does not admit the attempted action.
    #[error("role violation: {agent_id} attempted {action}")]
    RoleViolation { agent_id: String, action: String },

    /// Policy engine unreachable (or breaker open) under fail-closed.
    #[error("policy engine unavailable")]
    PolicyUnavailable,

    /// Policy engine evaluated and denied.
    #[error("denied by policy ({} violations)", violations.len())]
    PolicyDenied { violations: Vec<String> },

    /// Impact model did not answer within its budget; fallback score applied.
    #[error("impact scoring timed out")]
    ScoreTimeout,

    /// Circuit breaker is open for a dependency; call failed fast.
    #[error("circuit breaker open: {dependency}")]
    BreakerOpen { dependency: String },

    /// Receiver inbox is full; caller may retry.
    #[error("backpressure: inbox full for {agent_id}")]
    Backpressure { agent_id: String },

    /// Stage observed a cancel before side effects.
    #[error("cancelled")]
    Cancelled,

    /// Cancel arrived after a non-cancellable external call had started.
    #[error("cancelled late")]
    CancelledLate,

    /// Unexpected internal failure; incident logged.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl BusError {
    /// Short stable label used in audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConstitutionalHashMismatch { .. } => "constitutional_hash_mismatch",
            Self::MessageMalformed { .. } => "message_malformed",
            Self::RoleViolation { .. } => "role_violation",
            Self::PolicyUnavailable => "policy_unavailable",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ScoreTimeout => "score_timeout",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Backpressure { .. } => "backpressure",
            Self::Cancelled => "cancelled",
            Self::CancelledLate => "cancelled_late",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Fatal errors are rejected and audited, never re-enqueued.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConstitutionalHashMismatch { .. }
                | Self::MessageMalformed { .. }
                | Self::RoleViolation { .. }
                | Self::PolicyDenied { .. }
                | Self::Internal { .. }
        )
    }

    /// Transient errors the caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::BreakerOpen { .. })
    }

    /// Audit severity for this kind. Role violations are elevated.
    pub fn severity(&self) -> Severity {
        match self {
            Self::RoleViolation { .. } => Severity::Elevated,
            Self::ConstitutionalHashMismatch { .. } | Self::Internal { .. } => Severity::Critical,
            Self::PolicyDenied { .. } | Self::PolicyUnavailable | Self::BreakerOpen { .. } => {
                Severity::Warning
            }
            _ => Severity::Info,
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MessageMalformed {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(BusError::RoleViolation {
            agent_id: "a".into(),
            action: "VALIDATE".into()
        }
        .is_fatal());
        assert!(!BusError::Backpressure {
            agent_id: "a".into()
        }
        .is_fatal());
        assert!(!BusError::ScoreTimeout.is_fatal());
    }

    #[test]
    fn test_role_violation_is_elevated() {
        let err = BusError::RoleViolation {
            agent_id: "exec-1".into(),
            action: "VALIDATE".into(),
        };
        assert_eq!(err.severity(), Severity::Elevated);
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(BusError::PolicyUnavailable.kind(), "policy_unavailable");
        assert_eq!(BusError::Cancelled.kind(), "cancelled");
        assert_eq!(
            BusError::ConstitutionalHashMismatch {
                expected: "x".into(),
                actual: "y".into()
            }
            .kind(),
            "constitutional_hash_mismatch"
        );
    }

    #[test]
    fn test_serde_tagged_roundtrip() {
        let err = BusError::PolicyDenied {
            violations: vec!["rule-1".into()],
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("policy_denied"));
        let back: BusError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}

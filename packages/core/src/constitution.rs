//! ACGS-Core: Constitutional Validation
//!
//! Every accepted message must carry the canonical constitutional hash
//! bit-identical. Validation is a pure function of the envelope; it never
//! consults external state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BusError;
use crate::message::MessageEnvelope;

/// Canonical constitutional hash: exactly 16 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstitutionalHash(String);

impl ConstitutionalHash {
    /// Parse and validate the canonical form.
    pub fn parse(value: &str) -> Result<Self, BusError> {
        if value.len() != 16 {
            return Err(BusError::malformed(format!(
                "constitutional hash must be 16 hex chars, got {}",
                value.len()
            )));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(BusError::malformed(
                "constitutional hash must be lowercase hex",
            ));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConstitutionalHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates envelopes against the canonical hash configured at boot.
#[derive(Debug, Clone)]
pub struct ConstitutionalValidator {
    canonical: ConstitutionalHash,
}

impl ConstitutionalValidator {
    pub fn new(canonical: ConstitutionalHash) -> Self {
        Self { canonical }
    }

    pub fn canonical(&self) -> &ConstitutionalHash {
        &self.canonical
    }

    /// Validate an envelope: well-formed fields first, then the hash.
    ///
    /// Rejects with `MessageMalformed` on missing/inconsistent fields and
    /// `ConstitutionalHashMismatch` when the carried hash differs from the
    /// canonical value.
    pub fn validate(&self, msg: &MessageEnvelope) -> Result<(), BusError> {
        if msg.message_id.is_nil() {
            return Err(BusError::malformed("message_id is nil"));
        }
        if msg.conversation_id.is_nil() {
            return Err(BusError::malformed("conversation_id is nil"));
        }
        if msg.from_agent.is_empty() {
            return Err(BusError::malformed("from_agent is empty"));
        }
        if msg.to_agent.is_empty() {
            return Err(BusError::malformed("to_agent is empty"));
        }
        if msg.from_agent == msg.to_agent {
            return Err(BusError::malformed(
                "from_agent equals to_agent for point-to-point message",
            ));
        }
        if msg.tenant_id.is_empty() {
            return Err(BusError::malformed("tenant_id is empty"));
        }
        if msg.created_at > msg.updated_at {
            return Err(BusError::malformed("created_at is after updated_at"));
        }
        if msg.constitutional_hash != self.canonical.0 {
            return Err(BusError::ConstitutionalHashMismatch {
                expected: self.canonical.0.clone(),
                actual: msg.constitutional_hash.clone(),
            });
        }
        Ok(())
    }
}

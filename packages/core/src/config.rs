//! ACGS-Core: Configuration Surface
//!
//! Every component receives its settings via construction; there are no
//! global constants. The canonical constitutional hash itself is
//! configuration, not a compile-time value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::agent::Role;
use crate::constitution::ConstitutionalHash;
use crate::error::BusError;

/// Deployment environment. Chaos profiles are refused in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

/// Circuit breaker shape: thresholds and cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before CLOSED -> OPEN
    pub failure_threshold: u32,
    /// Consecutive trial successes before HALF_OPEN -> CLOSED
    pub success_threshold: u32,
    /// Cooldown base (exponential backoff start)
    pub cooldown_base_ms: u64,
    /// Cooldown cap
    pub cooldown_cap_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_base_ms: 1_000,
            cooldown_cap_ms: 30_000,
        }
    }
}

/// Policy decision cache shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached decisions (LRU eviction beyond this)
    pub size: usize,
    /// Decision time-to-live in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 10_000,
            ttl_secs: 60,
        }
    }
}

/// Stage timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Policy evaluation budget
    pub policy_ms: u64,
    /// Impact scoring budget
    pub score_ms: u64,
    /// Default HITL wait (tier table may extend this)
    pub hitl_secs: u64,
    /// Graceful shutdown drain budget
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            policy_ms: 50,
            score_ms: 100,
            hitl_secs: 300,
            shutdown_secs: 30,
        }
    }
}

/// Fast/deliberation routing thresholds and sensitive-content triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Fast/deliberation boundary (lower-closed on the deliberation side)
    pub impact_threshold: f64,
    /// Human review required at or above this score
    pub hitl_threshold: f64,
    /// Multi-agent vote required at or above this score
    pub multi_vote_threshold: f64,
    /// Keyword sets that mark content sensitive (finance/PII/security)
    pub sensitive_keywords: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            impact_threshold: 0.80,
            hitl_threshold: 0.90,
            multi_vote_threshold: 0.95,
            sensitive_keywords: vec![
                "wire_transfer".to_string(),
                "account_number".to_string(),
                "payment".to_string(),
                "ssn".to_string(),
                "passport".to_string(),
                "date_of_birth".to_string(),
                "private_key".to_string(),
                "credential".to_string(),
                "password".to_string(),
            ],
        }
    }
}

/// Impact score combination weights. Extra factors are configuration; the
/// documented semantic/permission/drift weights stay exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub semantic_weight: f64,
    pub permission_weight: f64,
    pub drift_weight: f64,
    /// Additional named factors and their weights (sum kept <= 1 overall)
    pub extra_factors: HashMap<String, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.30,
            permission_weight: 0.20,
            drift_weight: 0.15,
            extra_factors: HashMap::new(),
        }
    }
}

/// Deliberation lane shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    /// Votes required to approve a multi-vote item
    pub required_votes: u32,
    /// Size of the critic pool consulted for multi-vote items
    pub total_critics: u32,
    /// Deadline for deliberation-only and HITL tiers
    pub review_deadline_secs: u64,
    /// Deadline for the multi-vote tier
    pub vote_deadline_secs: u64,
    /// Fast-lane processing budget, recorded for audit
    pub fast_budget_secs: u64,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            required_votes: 2,
            total_critics: 3,
            review_deadline_secs: 300,
            vote_deadline_secs: 600,
            fast_budget_secs: 30,
        }
    }
}

/// Metering pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    pub enabled: bool,
    pub queue_size: usize,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 8_192,
        }
    }
}

/// Audit pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub queue_size: usize,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_size: 8_192,
            flush_interval_ms: 100,
            batch_size: 64,
        }
    }
}

/// Per-role rate limits (messages per second).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub executive_per_sec: u32,
    pub legislative_per_sec: u32,
    pub judicial_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            executive_per_sec: 100,
            legislative_per_sec: 100,
            judicial_per_sec: 200,
        }
    }
}

impl RateLimitConfig {
    pub fn for_role(&self, role: Role) -> u32 {
        match role {
            Role::Executive => self.executive_per_sec,
            Role::Legislative => self.legislative_per_sec,
            Role::Judicial => self.judicial_per_sec,
        }
    }
}

/// A chaos profile: named injection points with deterministic, seeded
/// probabilities and a blast-radius cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosProfile {
    /// Profile name (for logs and audit)
    pub name: String,
    /// Profile-global seed; identical seeds replay identical fault streams
    pub seed: u64,
    /// Max fraction of concurrent requests that may be affected (0.0-1.0)
    #[serde(default = "ChaosProfile::default_blast_radius")]
    pub blast_radius: f64,
    /// Injection point -> failure probability
    pub points: HashMap<String, f64>,
}

impl ChaosProfile {
    fn default_blast_radius() -> f64 {
        0.25
    }
}

/// Top-level bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Canonical constitutional hash required on every message
    pub constitutional_hash: String,
    pub environment: Environment,
    /// Deny agents without a registry entry (strict) or default their role
    pub strict_role_mode: bool,
    /// Role assumed in loose mode for unregistered agents
    pub default_role: Role,
    /// Policy-engine errors deny (true) or allow with a warning tag (false)
    pub fail_closed: bool,
    /// Per-agent inbox capacity before `Backpressure`
    pub inbox_capacity: usize,
    pub routing: RoutingConfig,
    pub scoring: ScoringConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutConfig,
    pub deliberation: DeliberationConfig,
    pub metering: MeteringConfig,
    pub audit: AuditConfig,
    pub rate_limits: RateLimitConfig,
    /// Optional chaos profile; refused in production
    pub chaos: Option<ChaosProfile>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            constitutional_hash: "cdd01ef066bc6cf2".to_string(),
            environment: Environment::Development,
            strict_role_mode: true,
            default_role: Role::Executive,
            fail_closed: true,
            inbox_capacity: 256,
            routing: RoutingConfig::default(),
            scoring: ScoringConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            deliberation: DeliberationConfig::default(),
            metering: MeteringConfig::default(),
            audit: AuditConfig::default(),
            rate_limits: RateLimitConfig::default(),
            chaos: None,
        }
    }
}

impl BusConfig {
    /// Load from a YAML file and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BusError::internal(format!("read config: {e}")))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| BusError::internal(format!("parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), BusError> {
        ConstitutionalHash::parse(&self.constitutional_hash)?;

        let r = &self.routing;
        if !(r.impact_threshold <= r.hitl_threshold && r.hitl_threshold <= r.multi_vote_threshold) {
            return Err(BusError::internal(
                "routing thresholds must be ordered impact <= hitl <= multi_vote",
            ));
        }
        for t in [r.impact_threshold, r.hitl_threshold, r.multi_vote_threshold] {
            if !(0.0..=1.0).contains(&t) {
                return Err(BusError::internal("routing thresholds must be in [0,1]"));
            }
        }

        let s = &self.scoring;
        let total: f64 = s.semantic_weight
            + s.permission_weight
            + s.drift_weight
            + s.extra_factors.values().sum::<f64>();
        if total > 1.0 + f64::EPSILON {
            return Err(BusError::internal("impact weights must sum to <= 1.0"));
        }

        if self.environment == Environment::Production && self.chaos.is_some() {
            return Err(BusError::internal(
                "chaos profiles are not allowed in production",
            ));
        }

        if self.deliberation.required_votes > self.deliberation.total_critics {
            return Err(BusError::internal(
                "required_votes cannot exceed total_critics",
            ));
        }

        Ok(())
    }

    /// Parsed canonical hash. `validate()` must have passed.
    pub fn canonical_hash(&self) -> Result<ConstitutionalHash, BusError> {
        ConstitutionalHash::parse(&self.constitutional_hash)
    }
}

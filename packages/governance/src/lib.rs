//! ACGS-Governance: Decision Layer
//!
//! Everything that decides what may happen to a message:
//! - MACI three-branch role separation
//! - Policy evaluation with caching, single-flight and fail policy
//! - Impact scoring (semantic / permission / drift)
//! - Adaptive fast-lane vs deliberation-lane routing

pub mod fingerprint;
pub mod maci;
pub mod policy;
pub mod router;
pub mod scoring;

pub use fingerprint::policy_fingerprint;
pub use maci::{MaciAction, RoleRegistry};
pub use policy::{
    EngineResponse, EngineVerdict, HttpPolicyEngine, PolicyClient, PolicyDecision, PolicyEngine,
    Verdict,
};
pub use router::{AdaptiveRouter, Lane, ReviewRequirements, RouteDecision, RouteReason,
    HIGH_RISK_ACTIONS};
pub use scoring::{ImpactModel, ImpactScore, ImpactScorer, KeywordModel, ScoreComponents};

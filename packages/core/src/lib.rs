//! ACGS-Core: Data Model & Constitutional Validation
//!
//! Shared foundation for the Enhanced Agent Bus:
//! - Message envelope and agent records
//! - Constitutional hash validation
//! - The stable error contract every stage returns
//! - Configuration surface for every subsystem
//! - Cooperative cancellation context
//! - Versioned JSON persistence for the durable state the bus owns

pub mod agent;
pub mod config;
pub mod constitution;
pub mod context;
pub mod error;
pub mod message;
pub mod store;

pub use agent::{AgentRecord, AgentStatus, Role};
pub use config::{
    AuditConfig, BreakerConfig, BusConfig, CacheConfig, ChaosProfile, DeliberationConfig,
    Environment, MeteringConfig, RateLimitConfig, RoutingConfig, ScoringConfig, TimeoutConfig,
};
pub use constitution::{ConstitutionalHash, ConstitutionalValidator};
pub use context::ProcessContext;
pub use error::BusError;
pub use message::{MessageEnvelope, MessageType, Priority};
pub use store::JsonStore;

//! ACGS-Resilience: Antifragility Layer
//!
//! Fault isolation and self-healing around every external dependency:
//! - Per-dependency circuit breakers (CLOSED/OPEN/HALF_OPEN)
//! - Continuous health aggregation with fire-and-forget snapshots
//! - Recovery orchestration with four strategies
//! - Deterministic chaos injection for staging drills

pub mod breaker;
pub mod chaos;
pub mod health;
pub mod recovery;

pub use breaker::{BreakerEvent, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use chaos::{ChaosInjector, ChaosStats, InjectedFault};
pub use health::{HealthAggregator, HealthSnapshot};
pub use recovery::{RecoveryOrchestrator, RecoveryStrategy, RecoveryTask, RecoveryTaskState};

//! ACGS-Bus: Enhanced Agent Bus
//!
//! The concurrent, constitutionally-governed message broker of the
//! ACGS-2 platform. Every message walks a layered pipeline:
//! constitutional validation, trias-politica role separation, policy
//! evaluation, impact scoring, adaptive routing between a fast lane and
//! a deliberation lane, delivery, and tamper-evident audit anchoring.
//! Around the pipeline sit circuit breakers, health aggregation,
//! recovery orchestration and deterministic chaos injection.

pub mod bus;
pub mod processor;
pub mod runtime;
pub mod worker;

pub use bus::{AgentBus, AgentHandle, BusStats, DeadLetter};
pub use processor::{MessageProcessor, ProcessOutcome, ProcessorStats};
pub use runtime::{BusBuilder, EnhancedAgentBus, POLICY_ENGINE};
pub use worker::DeliberationWorker;

//! ACGS-Telemetry: Fire-and-Forget Pipelines
//!
//! Audit anchoring and usage metering share one shape: the caller pushes
//! a compact record into a bounded in-process queue and returns in O(1);
//! background workers batch and flush to external sinks through circuit
//! breakers. Overflow drops the oldest record and counts the drop.

pub mod audit;
pub mod metering;
pub mod queue;

pub use audit::{AuditEntry, AuditPipeline, AuditSink, AuditStats, MemoryAuditSink};
pub use metering::{
    MemoryMeteringSink, MeteringQueue, MeteringSink, MeteringStats, MetricType, UsageEvent,
};
pub use queue::FireAndForgetQueue;

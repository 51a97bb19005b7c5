//! ACGS-Core: Processing Context
//!
//! Cooperative cancellation and deadlines. Every pipeline stage calls
//! `check()` before doing work; on cancel the stage returns `Cancelled`
//! without partial delivery. Where an external call cannot be cancelled,
//! the stage finishes best-effort and tags the audit record
//! `cancelled_late`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::BusError;

/// Shared cancellation/deadline handle for one message's pipeline run.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessContext {
    /// Context with no deadline.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// Context that expires after `budget`.
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether a cancel has been requested or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Stage entry check: `Err(Cancelled)` once cancelled or expired.
    pub fn check(&self) -> Result<(), BusError> {
        if self.is_cancelled() {
            Err(BusError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp a stage budget to the remaining deadline.
    pub fn clamp(&self, budget: Duration) -> Duration {
        match self.remaining() {
            Some(rem) => budget.min(rem),
            None => budget,
        }
    }
}

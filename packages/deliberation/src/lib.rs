//! ACGS-Deliberation: The Slow Lane
//!
//! High-impact messages wait here for review instead of being delivered
//! directly: a tiered FIFO queue of items, multi-agent voting with a
//! Judicial veto, and a human-in-the-loop workflow with idempotent
//! callbacks. Items and their retained envelopes are the durable state of
//! the bus.

pub mod hitl;
pub mod item;
pub mod queue;
pub mod voting;

pub use hitl::{HitlManager, Notifier, WebhookNotifier};
pub use item::{DeliberationItem, DeliberationState, HumanReview, Vote};
pub use queue::DeliberationQueue;
pub use voting::{votes_digest, TallyOutcome, VotingService};

//! ACGS-Resilience: Recovery Orchestration
//!
//! Priority queue of recovery tasks over degraded dependencies. Four
//! strategies: exponential backoff, linear backoff, immediate, and manual
//! (parked until an operator releases it). Scheduling a retry arms the
//! dependency's breaker so a HALF_OPEN trial is admitted at the scheduled
//! time; the next guarded call performs the trial.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::breaker::{BreakerRegistry, BreakerState};

/// How a task schedules its retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum RecoveryStrategy {
    /// Retry at base * 2^attempt, bounded by max_attempts
    ExponentialBackoff { base_ms: u64, max_attempts: u32 },
    /// Retry at base * attempt, bounded by max_attempts
    LinearBackoff { base_ms: u64, max_attempts: u32 },
    /// Retry without delay, bounded by max_attempts
    Immediate { max_attempts: u32 },
    /// Park until an operator call releases the task
    Manual,
}

impl RecoveryStrategy {
    /// Delay before attempt number `attempt` (0-based), or `None` when
    /// the strategy is exhausted or parked.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::ExponentialBackoff { base_ms, max_attempts } => {
                if attempt >= *max_attempts {
                    None
                } else {
                    let factor = 2u64.saturating_pow(attempt);
                    Some(Duration::from_millis(base_ms.saturating_mul(factor)))
                }
            }
            Self::LinearBackoff { base_ms, max_attempts } => {
                if attempt >= *max_attempts {
                    None
                } else {
                    Some(Duration::from_millis(
                        base_ms.saturating_mul(u64::from(attempt) + 1),
                    ))
                }
            }
            Self::Immediate { max_attempts } => {
                if attempt >= *max_attempts {
                    None
                } else {
                    Some(Duration::ZERO)
                }
            }
            Self::Manual => None,
        }
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTaskState {
    Scheduled,
    Parked,
    Completed,
    Exhausted,
}

/// One recovery task for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTask {
    pub id: Uuid,
    pub dependency: String,
    /// Higher importance is recovered first
    pub importance: u8,
    pub strategy: RecoveryStrategy,
    pub attempt: u32,
    pub state: RecoveryTaskState,
    pub created_at: DateTime<Utc>,
}

struct HeapEntry {
    importance: u8,
    due: Instant,
    task_id: Uuid,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher importance first, then earlier due time
        self.importance
            .cmp(&other.importance)
            .then_with(|| other.due.cmp(&self.due))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Schedules and drives recovery tasks.
pub struct RecoveryOrchestrator {
    registry: Arc<BreakerRegistry>,
    queue: Mutex<BinaryHeap<HeapEntry>>,
    tasks: Mutex<HashMap<Uuid, RecoveryTask>>,
}

impl RecoveryOrchestrator {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            queue: Mutex::new(BinaryHeap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule recovery for a dependency. Manual tasks park immediately.
    pub fn schedule(
        &self,
        dependency: impl Into<String>,
        importance: u8,
        strategy: RecoveryStrategy,
    ) -> Uuid {
        let dependency = dependency.into();
        let id = Uuid::new_v4();
        let mut task = RecoveryTask {
            id,
            dependency: dependency.clone(),
            importance,
            strategy,
            attempt: 0,
            state: RecoveryTaskState::Scheduled,
            created_at: Utc::now(),
        };

        match strategy.delay_for(0) {
            Some(delay) => {
                let due = Instant::now() + delay;
                self.registry.breaker(&dependency).schedule_trial(due);
                self.queue.lock().push(HeapEntry {
                    importance,
                    due,
                    task_id: id,
                });
            }
            None => {
                task.state = RecoveryTaskState::Parked;
                tracing::info!(dependency = %dependency, task_id = %id, "recovery task parked for manual release");
            }
        }

        self.tasks.lock().insert(id, task);
        id
    }

    /// Operator release for a parked (manual) task: admit a trial now.
    pub fn release(&self, task_id: Uuid) -> bool {
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return false;
        };
        if task.state != RecoveryTaskState::Parked {
            return false;
        }
        task.state = RecoveryTaskState::Scheduled;
        let due = Instant::now();
        self.registry.breaker(&task.dependency).schedule_trial(due);
        self.queue.lock().push(HeapEntry {
            importance: task.importance,
            due,
            task_id,
        });
        true
    }

    /// Process due tasks: a recovered dependency completes its task, a
    /// still-degraded one is rescheduled per its strategy (or exhausted).
    /// Returns the tasks touched this pass.
    pub fn run_due(&self) -> Vec<RecoveryTask> {
        let now = Instant::now();
        let mut touched = Vec::new();

        // Drain everything currently due; entries rescheduled below run on
        // a later pass, not this one.
        let mut due_entries = Vec::new();
        {
            let mut queue = self.queue.lock();
            while matches!(queue.peek(), Some(entry) if entry.due <= now) {
                if let Some(entry) = queue.pop() {
                    due_entries.push(entry);
                }
            }
        }

        for entry in due_entries {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.state != RecoveryTaskState::Scheduled {
                continue;
            }

            let breaker = self.registry.breaker(&task.dependency);
            match breaker.state() {
                BreakerState::Closed => {
                    task.state = RecoveryTaskState::Completed;
                    tracing::info!(dependency = %task.dependency, "dependency recovered");
                }
                BreakerState::Open | BreakerState::HalfOpen => {
                    task.attempt += 1;
                    match task.strategy.delay_for(task.attempt) {
                        Some(delay) => {
                            let due = Instant::now() + delay;
                            breaker.schedule_trial(due);
                            self.queue.lock().push(HeapEntry {
                                importance: task.importance,
                                due,
                                task_id: task.id,
                            });
                        }
                        None => {
                            task.state = if task.strategy == RecoveryStrategy::Manual {
                                RecoveryTaskState::Parked
                            } else {
                                RecoveryTaskState::Exhausted
                            };
                            tracing::warn!(
                                dependency = %task.dependency,
                                attempts = task.attempt,
                                "recovery attempts exhausted"
                            );
                        }
                    }
                }
            }
            touched.push(task.clone());
        }
        touched
    }

    /// Schedule only when the dependency has no open recovery task.
    /// Returns the existing or new task id.
    pub fn ensure_scheduled(
        &self,
        dependency: &str,
        importance: u8,
        strategy: RecoveryStrategy,
    ) -> Uuid {
        let open = self.tasks.lock().values().find_map(|task| {
            let open = task.dependency == dependency
                && matches!(
                    task.state,
                    RecoveryTaskState::Scheduled | RecoveryTaskState::Parked
                );
            open.then_some(task.id)
        });
        match open {
            Some(id) => id,
            None => self.schedule(dependency, importance, strategy),
        }
    }

    pub fn task(&self, task_id: Uuid) -> Option<RecoveryTask> {
        self.tasks.lock().get(&task_id).cloned()
    }

    pub fn tasks_for(&self, dependency: &str) -> Vec<RecoveryTask> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.dependency == dependency)
            .cloned()
            .collect()
    }

    /// Background loop driving `run_due` on a short tick.
    pub async fn run(self: Arc<Self>, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            self.run_due();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::{BreakerConfig, BusError};

    fn registry() -> Arc<BreakerRegistry> {
        Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            cooldown_base_ms: 60_000, // long: recovery controls the trials
            cooldown_cap_ms: 60_000,
        }))
    }

    async fn trip(registry: &BreakerRegistry, name: &str) {
        let breaker = registry.breaker(name);
        for _ in 0..2 {
            let _ = breaker
                .call::<(), _>(async { Err(BusError::internal("down")) })
                .await;
        }
    }

    #[test]
    fn test_strategy_delays() {
        let exp = RecoveryStrategy::ExponentialBackoff {
            base_ms: 100,
            max_attempts: 3,
        };
        assert_eq!(exp.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(exp.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(exp.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(exp.delay_for(3), None);

        let lin = RecoveryStrategy::LinearBackoff {
            base_ms: 100,
            max_attempts: 2,
        };
        assert_eq!(lin.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(lin.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(lin.delay_for(2), None);

        assert_eq!(
            RecoveryStrategy::Immediate { max_attempts: 1 }.delay_for(0),
            Some(Duration::ZERO)
        );
        assert_eq!(RecoveryStrategy::Manual.delay_for(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_trial_after_backoff() {
        let registry = registry();
        trip(&registry, "policy-engine").await;

        let orchestrator = RecoveryOrchestrator::new(registry.clone());
        orchestrator.schedule(
            "policy-engine",
            10,
            RecoveryStrategy::ExponentialBackoff {
                base_ms: 100,
                max_attempts: 3,
            },
        );

        // Before the backoff elapses the breaker still fails fast
        assert!(registry.breaker("policy-engine").try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(150)).await;
        // Trial is now admitted (breaker armed at the scheduled time)
        assert!(registry.breaker("policy-engine").try_acquire().is_ok());
        registry.breaker("policy-engine").record(true);
        assert_eq!(
            registry.breaker("policy-engine").state(),
            BreakerState::Closed
        );

        let touched = orchestrator.run_due();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].state, RecoveryTaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion() {
        let registry = registry();
        trip(&registry, "policy-engine").await;

        let orchestrator = RecoveryOrchestrator::new(registry.clone());
        let id = orchestrator.schedule(
            "policy-engine",
            5,
            RecoveryStrategy::Immediate { max_attempts: 2 },
        );

        // Dependency never recovers; drive until exhausted
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(1)).await;
            orchestrator.run_due();
        }
        assert_eq!(
            orchestrator.task(id).unwrap().state,
            RecoveryTaskState::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_parks_until_release() {
        let registry = registry();
        trip(&registry, "audit-sink").await;

        let orchestrator = RecoveryOrchestrator::new(registry.clone());
        let id = orchestrator.schedule("audit-sink", 1, RecoveryStrategy::Manual);
        assert_eq!(
            orchestrator.task(id).unwrap().state,
            RecoveryTaskState::Parked
        );
        assert!(registry.breaker("audit-sink").try_acquire().is_err());

        assert!(orchestrator.release(id));
        assert!(registry.breaker("audit-sink").try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_importance_orders_recovery() {
        let registry = registry();
        trip(&registry, "minor").await;
        trip(&registry, "major").await;

        let orchestrator = RecoveryOrchestrator::new(registry.clone());
        orchestrator.schedule("minor", 1, RecoveryStrategy::Immediate { max_attempts: 5 });
        orchestrator.schedule("major", 9, RecoveryStrategy::Immediate { max_attempts: 5 });

        tokio::time::advance(Duration::from_millis(1)).await;
        let touched = orchestrator.run_due();
        assert_eq!(touched[0].dependency, "major");
        assert_eq!(touched[1].dependency, "minor");
    }
}

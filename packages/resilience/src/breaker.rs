//! ACGS-Resilience: Circuit Breaker
//!
//! Per-dependency three-state FSM. CLOSED trips to OPEN after N
//! consecutive failures; OPEN cools down exponentially and then admits
//! exactly one HALF_OPEN trial at a time; M consecutive trial successes
//! close the breaker, any trial failure re-opens it with a doubled
//! cooldown. All transitions are serialized behind the breaker's lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use acgs_core::{BreakerConfig, BusError};

/// Breaker FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Health contribution of this state.
    pub fn health_score(&self) -> f64 {
        match self {
            Self::Closed => 1.0,
            Self::HalfOpen => 0.5,
            Self::Open => 0.0,
        }
    }
}

/// Emitted on every state transition.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub dependency: String,
    pub state: BreakerState,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    trial_successes: u32,
    trial_in_flight: bool,
    cooldown: Duration,
    cooldown_end: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
}

/// A circuit breaker guarding one external dependency.
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<broadcast::Sender<BreakerEvent>>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = Duration::from_millis(config.cooldown_base_ms);
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                trial_successes: 0,
                trial_in_flight: false,
                cooldown,
                cooldown_end: None,
                opened_at: None,
            }),
            events: None,
        }
    }

    fn with_events(mut self, events: broadcast::Sender<BreakerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Current state. Does not advance the FSM.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            cooldown_ms: inner.cooldown.as_millis() as u64,
        }
    }

    fn emit(&self, state: BreakerState) {
        if let Some(events) = &self.events {
            // Fire-and-forget; nobody listening is fine.
            let _ = events.send(BreakerEvent {
                dependency: self.dependency.clone(),
                state,
            });
        }
    }

    /// Try to take a call slot. OPEN fails fast; an expired cooldown
    /// admits exactly one HALF_OPEN trial.
    pub fn try_acquire(&self) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let expired = matches!(inner.cooldown_end, Some(end) if Instant::now() >= end);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_successes = 0;
                    inner.trial_in_flight = true;
                    drop(inner);
                    self.emit(BreakerState::HalfOpen);
                    tracing::info!(dependency = %self.dependency, "breaker half-open, trial admitted");
                    Ok(())
                } else {
                    Err(BusError::BreakerOpen {
                        dependency: self.dependency.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BusError::BreakerOpen {
                        dependency: self.dependency.clone(),
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record the outcome of a call admitted by `try_acquire`.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.open_locked(&mut inner, false);
                        drop(inner);
                        self.emit(BreakerState::Open);
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                if success {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.success_threshold {
                        inner.state = BreakerState::Closed;
                        inner.consecutive_failures = 0;
                        inner.trial_successes = 0;
                        inner.cooldown = Duration::from_millis(self.config.cooldown_base_ms);
                        inner.cooldown_end = None;
                        inner.opened_at = None;
                        drop(inner);
                        self.emit(BreakerState::Closed);
                        tracing::info!(dependency = %self.dependency, "breaker closed");
                    }
                } else {
                    self.open_locked(&mut inner, true);
                    drop(inner);
                    self.emit(BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner, double_cooldown: bool) {
        if double_cooldown {
            let doubled = inner.cooldown.as_millis() as u64 * 2;
            inner.cooldown = Duration::from_millis(doubled.min(self.config.cooldown_cap_ms));
        }
        inner.state = BreakerState::Open;
        inner.trial_successes = 0;
        inner.trial_in_flight = false;
        inner.cooldown_end = Some(Instant::now() + inner.cooldown);
        inner.opened_at = Some(Utc::now());
        tracing::warn!(
            dependency = %self.dependency,
            cooldown_ms = inner.cooldown.as_millis() as u64,
            "breaker opened"
        );
    }

    /// Arm the breaker so a HALF_OPEN trial is admitted at `at`. Used by
    /// the recovery orchestrator; scheduling a retry is exactly this.
    pub fn schedule_trial(&self, at: Instant) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::Open {
            inner.cooldown_end = Some(at);
        }
    }

    /// Run `op` through the breaker: fail fast when open, otherwise
    /// execute and record the outcome.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, BusError>
    where
        Fut: Future<Output = Result<T, BusError>>,
    {
        self.try_acquire()?;
        match op.await {
            Ok(value) => {
                self.record(true);
                Ok(value)
            }
            Err(err) => {
                self.record(false);
                Err(err)
            }
        }
    }
}

/// All breakers, keyed by dependency name, with per-dependency weights
/// for health folding.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    weights: RwLock<HashMap<String, f64>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            weights: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Get or create the breaker for a dependency.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(dependency) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(dependency, self.config.clone())
                        .with_events(self.events.clone()),
                )
            })
            .clone()
    }

    /// Set the health weight of a dependency (default 1.0).
    pub fn set_weight(&self, dependency: &str, weight: f64) {
        self.weights.write().insert(dependency.to_string(), weight);
    }

    pub fn weight(&self, dependency: &str) -> f64 {
        self.weights.read().get(dependency).copied().unwrap_or(1.0)
    }

    /// Subscribe to state transitions across all breakers.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown_base_ms: 100,
            cooldown_cap_ms: 800,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .call::<(), _>(async { Err(BusError::internal("boom")) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.call(async { Ok(()) }).await;
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("policy", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open fails fast without running the op
        let err = breaker
            .call(async { Ok::<_, BusError>(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("policy", config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_admits_single_trial() {
        let breaker = CircuitBreaker::new("policy", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        // First acquire transitions to HALF_OPEN and takes the only permit
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // No thundering herd: second concurrent trial is refused
        assert!(breaker.try_acquire().is_err());
        breaker.record(true);

        // Next trial allowed after the first resolves
        assert!(breaker.try_acquire().is_ok());
        breaker.record(true);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_doubles_cooldown() {
        let breaker = CircuitBreaker::new("policy", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.snapshot().cooldown_ms, 100);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(breaker.try_acquire().is_ok());
        breaker.record(false);

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().cooldown_ms, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_capped() {
        let breaker = CircuitBreaker::new("policy", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        for _ in 0..6 {
            tokio::time::advance(Duration::from_millis(1_000)).await;
            if breaker.try_acquire().is_ok() {
                breaker.record(false);
            }
        }
        assert!(breaker.snapshot().cooldown_ms <= 800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_trial() {
        let breaker = CircuitBreaker::new("policy", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        // Pull the trial forward to now
        breaker.schedule_trial(Instant::now());
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_registry_emits_events() {
        let registry = BreakerRegistry::new(config());
        let mut events = registry.subscribe();
        let breaker = registry.breaker("audit-sink");
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let event = events.recv().await.unwrap();
        assert_eq!(event.dependency, "audit-sink");
        assert_eq!(event.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_registry_reuses_breaker() {
        let registry = BreakerRegistry::new(config());
        let a = registry.breaker("x");
        let b = registry.breaker("x");
        assert!(Arc::ptr_eq(&a, &b));
    }
}

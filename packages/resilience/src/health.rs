//! ACGS-Resilience: Health Aggregation
//!
//! Folds breaker states into a global score in [0,1]: CLOSED counts 1.0,
//! HALF_OPEN 0.5, OPEN 0.0, weighted per component. Snapshots go out over
//! a `watch` channel, so slow subscribers read the latest value and never
//! stall the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::breaker::{BreakerRegistry, BreakerState};

/// Point-in-time health fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ts: DateTime<Utc>,
    /// Weighted mean of component scores, 1.0 when nothing is degraded
    pub global_score: f64,
    pub per_component: HashMap<String, f64>,
    pub open_breakers: Vec<String>,
    /// Fire-and-forget drops observed by telemetry queues
    pub dropped_events: u64,
}

impl HealthSnapshot {
    fn healthy() -> Self {
        Self {
            ts: Utc::now(),
            global_score: 1.0,
            per_component: HashMap::new(),
            open_breakers: Vec::new(),
            dropped_events: 0,
        }
    }
}

/// Continuously recomputes the global health score.
pub struct HealthAggregator {
    registry: Arc<BreakerRegistry>,
    interval: Duration,
    tx: watch::Sender<HealthSnapshot>,
    drop_counter: Option<Arc<dyn Fn() -> u64 + Send + Sync>>,
}

impl HealthAggregator {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        let (tx, _) = watch::channel(HealthSnapshot::healthy());
        Self {
            registry,
            interval: Duration::from_secs(1),
            tx,
            drop_counter: None,
        }
    }

    /// Override the poll interval (default 1 s).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Wire in the telemetry drop counter so drops surface in snapshots.
    pub fn with_drop_counter(
        mut self,
        counter: Arc<dyn Fn() -> u64 + Send + Sync>,
    ) -> Self {
        self.drop_counter = Some(counter);
        self
    }

    /// Latest snapshot without blocking the writer.
    pub fn current(&self) -> HealthSnapshot {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot changes. Best-effort: a slow reader only ever
    /// misses intermediate values, never blocks the producer.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.tx.subscribe()
    }

    /// Recompute and publish if the score changed.
    pub fn refresh(&self) -> HealthSnapshot {
        let snapshot = self.compute();
        self.tx.send_if_modified(|current| {
            let changed = (current.global_score - snapshot.global_score).abs() > f64::EPSILON
                || current.open_breakers != snapshot.open_breakers;
            if changed {
                *current = snapshot.clone();
            }
            changed
        });
        snapshot
    }

    fn compute(&self) -> HealthSnapshot {
        let snapshots = self.registry.snapshots();
        let mut per_component = HashMap::new();
        let mut open_breakers = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        for snap in &snapshots {
            let score = snap.state.health_score();
            let weight = self.registry.weight(&snap.dependency);
            per_component.insert(snap.dependency.clone(), score);
            weighted_sum += score * weight;
            weight_total += weight;
            if snap.state == BreakerState::Open {
                open_breakers.push(snap.dependency.clone());
            }
        }
        open_breakers.sort();

        let global_score = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            1.0
        };

        HealthSnapshot {
            ts: Utc::now(),
            global_score,
            per_component,
            open_breakers,
            dropped_events: self.drop_counter.as_ref().map(|f| f()).unwrap_or(0),
        }
    }

    /// Background loop: refresh on every breaker transition and on the
    /// poll interval. Runs until the registry's event channel closes and
    /// the task is aborted at shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut events = self.registry.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh();
                }
                event = events.recv() => {
                    match event {
                        Ok(_) => {
                            self.refresh();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "health aggregator lagged breaker events");
                            self.refresh();
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}

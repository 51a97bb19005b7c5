//! ACGS-Resilience: Chaos Injection
//!
//! Deterministic fault injection for staging drills. A profile names
//! injection points and failure probabilities; the decision stream at each
//! point is derived from the profile-global seed, so a run with the same
//! seed replays the same faults. A blast-radius cap bounds the fraction of
//! requests affected and an emergency-stop flag kills all injection at
//! once. Production mode never injects.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

use acgs_core::{ChaosProfile, Environment};

/// A fault injected at a labeled point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chaos fault at {point} (profile {profile})")]
pub struct InjectedFault {
    pub point: String,
    pub profile: String,
}

/// Injection counters.
#[derive(Debug, Clone, Default)]
pub struct ChaosStats {
    pub evaluated: u64,
    pub injected: u64,
}

/// Deterministic chaos injector. Disabled unless a profile is loaded in a
/// non-production environment.
pub struct ChaosInjector {
    profile: Option<ChaosProfile>,
    emergency_stop: AtomicBool,
    evaluated: AtomicU64,
    injected: AtomicU64,
    // One deterministic decision stream per injection point
    streams: Mutex<HashMap<String, StdRng>>,
}

impl ChaosInjector {
    /// Build from configuration. Any profile is dropped in production.
    pub fn from_config(environment: Environment, profile: Option<ChaosProfile>) -> Self {
        let profile = match (environment, profile) {
            (Environment::Production, Some(p)) => {
                tracing::warn!(profile = %p.name, "chaos profile ignored in production");
                None
            }
            (_, p) => p,
        };
        Self {
            profile,
            emergency_stop: AtomicBool::new(false),
            evaluated: AtomicU64::new(0),
            injected: AtomicU64::new(0),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Passthrough injector.
    pub fn disabled() -> Self {
        Self::from_config(Environment::Development, None)
    }

    pub fn is_active(&self) -> bool {
        self.profile.is_some() && !self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Flip the emergency stop; every injection point observes it.
    pub fn emergency_stop(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
        tracing::warn!("chaos emergency stop engaged");
    }

    /// Seed for one point's stream: profile seed mixed with the label.
    fn point_seed(seed: u64, point: &str) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(point.as_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]))
    }

    /// Evaluate one labeled injection point. Returns the fault to apply,
    /// or `None` to proceed normally.
    pub fn intercept(&self, point: &str) -> Option<InjectedFault> {
        let profile = self.profile.as_ref()?;
        if self.emergency_stop.load(Ordering::SeqCst) {
            return None;
        }
        let probability = *profile.points.get(point)?;
        if probability <= 0.0 {
            return None;
        }

        let evaluated = self.evaluated.fetch_add(1, Ordering::Relaxed) + 1;

        let roll: f64 = {
            let mut streams = self.streams.lock();
            let rng = streams.entry(point.to_string()).or_insert_with(|| {
                StdRng::seed_from_u64(Self::point_seed(profile.seed, point))
            });
            rng.random()
        };

        if roll >= probability {
            return None;
        }

        // Blast radius: cap the injected fraction of the request stream.
        let injected = self.injected.load(Ordering::Relaxed);
        if (injected + 1) as f64 > profile.blast_radius * evaluated as f64 {
            return None;
        }

        self.injected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(point = %point, profile = %profile.name, "chaos fault injected");
        Some(InjectedFault {
            point: point.to_string(),
            profile: profile.name.clone(),
        })
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            evaluated: self.evaluated.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
        }
    }
}

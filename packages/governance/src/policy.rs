//! ACGS-Governance: Policy Client
//!
//! Evaluates messages against an external policy engine through a circuit
//! breaker, with an LRU+TTL decision cache and per-fingerprint
//! single-flight so concurrent misses coalesce into one upstream call.
//! Engine failure behavior is governed by `fail_closed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use acgs_core::{BusError, CacheConfig, ProcessContext};
use acgs_resilience::{ChaosInjector, CircuitBreaker};

use crate::fingerprint::policy_fingerprint;

/// What the engine answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVerdict {
    Allow,
    Deny,
}

/// Raw engine response: `{decision, violations, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub decision: EngineVerdict,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Engine abstraction; the core never assumes a particular engine.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(
        &self,
        policy_path: &str,
        input: &serde_json::Value,
    ) -> Result<EngineResponse, BusError>;
}

/// Decision as seen by the pipeline. `Error` marks an engine-error path
/// decided by fail policy rather than evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
    Error,
}

/// A cached, immutable policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub fingerprint: String,
    pub decision: Verdict,
    pub violations: Vec<String>,
    pub metadata: serde_json::Value,
    pub evaluated_at: DateTime<Utc>,
    /// Warning tags ("fail_open", ...); audited alongside the decision
    pub tags: Vec<String>,
}

impl PolicyDecision {
    pub fn allowed(&self) -> bool {
        matches!(self.decision, Verdict::Allow)
    }
}

struct CacheEntry {
    decision: PolicyDecision,
    expires: Instant,
    stamp: u64,
}

/// LRU with TTL. Recency is tracked lazily: every touch pushes a stamped
/// key and eviction skips stale stamps.
struct DecisionCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    recency: VecDeque<(String, u64)>,
    clock: u64,
}

impl DecisionCache {
    fn new(config: &CacheConfig) -> Self {
        Self {
            capacity: config.size.max(1),
            ttl: Duration::from_secs(config.ttl_secs),
            entries: HashMap::new(),
            recency: VecDeque::new(),
            clock: 0,
        }
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stamp = stamp;
            self.recency.push_back((key.to_string(), stamp));
        }
    }

    fn get(&mut self, key: &str) -> Option<PolicyDecision> {
        match self.entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => {
                let decision = entry.decision.clone();
                self.touch(key);
                Some(decision)
            }
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, decision: PolicyDecision) {
        self.clock += 1;
        let stamp = self.clock;
        self.recency.push_back((key.clone(), stamp));
        self.entries.insert(
            key,
            CacheEntry {
                decision,
                expires: Instant::now() + self.ttl,
                stamp,
            },
        );
        while self.entries.len() > self.capacity {
            match self.recency.pop_front() {
                Some((old_key, old_stamp)) => {
                    let evict = matches!(
                        self.entries.get(&old_key),
                        Some(entry) if entry.stamp == old_stamp
                    );
                    if evict {
                        self.entries.remove(&old_key);
                    }
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Policy evaluation client (C4).
pub struct PolicyClient {
    engine: Arc<dyn PolicyEngine>,
    breaker: Arc<CircuitBreaker>,
    chaos: Arc<ChaosInjector>,
    cache: Mutex<DecisionCache>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    fail_closed: bool,
    timeout: Duration,
}

impl PolicyClient {
    pub fn new(
        engine: Arc<dyn PolicyEngine>,
        breaker: Arc<CircuitBreaker>,
        cache_config: &CacheConfig,
        fail_closed: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            breaker,
            chaos: Arc::new(ChaosInjector::disabled()),
            cache: Mutex::new(DecisionCache::new(cache_config)),
            inflight: Mutex::new(HashMap::new()),
            fail_closed,
            timeout,
        }
    }

    /// Wire in the shared chaos injector.
    pub fn with_chaos(mut self, chaos: Arc<ChaosInjector>) -> Self {
        self.chaos = chaos;
        self
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.lock().len()
    }

    /// Evaluate `(policy_path, input)`. Cache hit returns immediately;
    /// a miss goes upstream once per fingerprint, whatever the number of
    /// concurrent callers.
    pub async fn evaluate(
        &self,
        ctx: &ProcessContext,
        policy_path: &str,
        input: &serde_json::Value,
    ) -> Result<PolicyDecision, BusError> {
        ctx.check()?;
        let fingerprint = policy_fingerprint(policy_path, input);

        if let Some(hit) = self.cache.lock().get(&fingerprint) {
            return Ok(hit);
        }

        let gate = self
            .inflight
            .lock()
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A coalesced caller may find the decision filled in by the winner.
        if let Some(hit) = self.cache.lock().get(&fingerprint) {
            return Ok(hit);
        }

        let outcome = self.call_engine(ctx, policy_path, input).await;
        self.inflight.lock().remove(&fingerprint);

        match outcome {
            Ok(response) => {
                let decision = PolicyDecision {
                    fingerprint: fingerprint.clone(),
                    decision: match response.decision {
                        EngineVerdict::Allow => Verdict::Allow,
                        EngineVerdict::Deny => Verdict::Deny,
                    },
                    violations: response.violations,
                    metadata: response.metadata,
                    evaluated_at: Utc::now(),
                    tags: Vec::new(),
                };
                self.cache
                    .lock()
                    .insert(fingerprint, decision.clone());
                Ok(decision)
            }
            Err(err) => {
                tracing::warn!(error = %err, fingerprint = %fingerprint, "policy engine unavailable");
                if self.fail_closed {
                    Err(BusError::PolicyUnavailable)
                } else {
                    // Fail-open: allow with a warning tag; never cached so
                    // recovery is observed on the next call.
                    Ok(PolicyDecision {
                        fingerprint,
                        decision: Verdict::Allow,
                        violations: Vec::new(),
                        metadata: serde_json::Value::Null,
                        evaluated_at: Utc::now(),
                        tags: vec!["policy_unavailable".to_string(), "fail_open".to_string()],
                    })
                }
            }
        }
    }

    /// Breaker-guarded engine call with one retry on transient transport
    /// errors. BreakerOpen is never retried here.
    async fn call_engine(
        &self,
        ctx: &ProcessContext,
        policy_path: &str,
        input: &serde_json::Value,
    ) -> Result<EngineResponse, BusError> {
        if let Some(fault) = self.chaos.intercept("policy.evaluate") {
            return Err(BusError::internal(fault.to_string()));
        }
        let budget = ctx.clamp(self.timeout);
        let mut last_err = BusError::PolicyUnavailable;
        for attempt in 0..2u8 {
            let result = self
                .breaker
                .call(async {
                    match tokio::time::timeout(budget, self.engine.evaluate(policy_path, input))
                        .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(BusError::internal("policy engine timed out")),
                    }
                })
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(err @ BusError::BreakerOpen { .. }) => return Err(err),
                Err(err) => {
                    if attempt == 0 {
                        tracing::debug!(error = %err, "transient policy transport error, retrying once");
                        last_err = err;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }
}

/// HTTP policy engine speaking `{policy_path, input}` ->
/// `{decision, violations, metadata}`.
pub struct HttpPolicyEngine {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPolicyEngine {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PolicyEngine for HttpPolicyEngine {
    async fn evaluate(
        &self,
        policy_path: &str,
        input: &serde_json::Value,
    ) -> Result<EngineResponse, BusError> {
        let body = serde_json::json!({
            "policy_path": policy_path,
            "input": input,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| BusError::internal(format!("policy engine transport: {e}")))?;
        if !response.status().is_success() {
            return Err(BusError::internal(format!(
                "policy engine status {}",
                response.status()
            )));
        }
        response
            .json::<EngineResponse>()
            .await
            .map_err(|e| BusError::internal(format!("policy engine body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingEngine {
        calls: AtomicU32,
        verdict: EngineVerdict,
        delay: Duration,
        fail: bool,
    }

    impl CountingEngine {
        fn allow() -> Self {
            Self {
                calls: AtomicU32::new(0),
                verdict: EngineVerdict::Allow,
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn deny() -> Self {
            Self {
                verdict: EngineVerdict::Deny,
                ..Self::allow()
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::allow()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicyEngine for CountingEngine {
        async fn evaluate(
            &self,
            _policy_path: &str,
            _input: &serde_json::Value,
        ) -> Result<EngineResponse, BusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(BusError::internal("connection refused"));
            }
            Ok(EngineResponse {
                decision: self.verdict,
                violations: if self.verdict == EngineVerdict::Deny {
                    vec!["rule-1".to_string()]
                } else {
                    Vec::new()
                },
                metadata: serde_json::Value::Null,
            })
        }
    }

    fn client(engine: Arc<CountingEngine>, fail_closed: bool) -> PolicyClient {
        let breaker = Arc::new(CircuitBreaker::new(
            "policy-engine",
            BreakerConfig::default(),
        ));
        PolicyClient::new(
            engine,
            breaker,
            &CacheConfig {
                size: 4,
                ttl_secs: 60,
            },
            fail_closed,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engine() {
        let engine = Arc::new(CountingEngine::allow());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();
        let input = serde_json::json!({"action": "query"});

        let first = client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        let second = client.evaluate(&ctx, "bus/allow", &input).await.unwrap();

        assert_eq!(engine.calls(), 1);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(second.allowed());
    }

    #[tokio::test]
    async fn test_deny_is_cached_and_identical() {
        let engine = Arc::new(CountingEngine::deny());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();
        let input = serde_json::json!({"action": "drop_tables"});

        let first = client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        let second = client.evaluate(&ctx, "bus/allow", &input).await.unwrap();

        assert_eq!(engine.calls(), 1);
        assert_eq!(first.decision, Verdict::Deny);
        assert_eq!(second.violations, vec!["rule-1".to_string()]);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_misses() {
        let engine = Arc::new(CountingEngine {
            delay: Duration::from_millis(20),
            ..CountingEngine::allow()
        });
        let client = Arc::new(client(engine.clone(), true));
        let input = serde_json::json!({"action": "query"});

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            let input = input.clone();
            handles.push(tokio::spawn(async move {
                let ctx = ProcessContext::new();
                client.evaluate(&ctx, "bus/allow", &input).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_returns_unavailable() {
        let engine = Arc::new(CountingEngine::failing());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();
        let input = serde_json::json!({"action": "query"});

        let err = client.evaluate(&ctx, "bus/allow", &input).await.unwrap_err();
        assert_eq!(err, BusError::PolicyUnavailable);
        // One retry on the transient transport error
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_open_allows_with_warning_tag() {
        let engine = Arc::new(CountingEngine::failing());
        let client = client(engine, false);
        let ctx = ProcessContext::new();
        let input = serde_json::json!({"action": "query"});

        let decision = client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        assert!(decision.allowed());
        assert!(decision.tags.contains(&"fail_open".to_string()));
        // Fail-open decisions are not cached
        assert_eq!(client.cached_decisions(), 0);
    }

    #[tokio::test]
    async fn test_breaker_open_maps_to_unavailable() {
        let engine = Arc::new(CountingEngine::failing());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();

        // Drive the breaker open (5 consecutive failures, 2 calls each)
        for i in 0..3 {
            let input = serde_json::json!({"attempt": i});
            let _ = client.evaluate(&ctx, "bus/allow", &input).await;
        }
        let calls_when_open = engine.calls();
        assert!(calls_when_open >= 5);

        // Breaker now fails fast: no more upstream calls
        let err = client
            .evaluate(&ctx, "bus/allow", &serde_json::json!({"attempt": 99}))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::PolicyUnavailable);
        assert_eq!(engine.calls(), calls_when_open);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let engine = Arc::new(CountingEngine::allow());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();

        for i in 0..6 {
            let input = serde_json::json!({"i": i});
            client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        }
        // Capacity 4: oldest entries evicted
        assert!(client.cached_decisions() <= 4);

        // Oldest input misses again
        let calls_before = engine.calls();
        client
            .evaluate(&ctx, "bus/allow", &serde_json::json!({"i": 0}))
            .await
            .unwrap();
        assert_eq!(engine.calls(), calls_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let engine = Arc::new(CountingEngine::allow());
        let breaker = Arc::new(CircuitBreaker::new(
            "policy-engine",
            BreakerConfig::default(),
        ));
        let client = PolicyClient::new(
            engine.clone(),
            breaker,
            &CacheConfig {
                size: 8,
                ttl_secs: 1,
            },
            true,
            Duration::from_millis(50),
        );
        let ctx = ProcessContext::new();
        let input = serde_json::json!({"action": "query"});

        client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        client.evaluate(&ctx, "bus/allow", &input).await.unwrap();
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let engine = Arc::new(CountingEngine::allow());
        let client = client(engine.clone(), true);
        let ctx = ProcessContext::new();
        ctx.cancel();

        let err = client
            .evaluate(&ctx, "bus/allow", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BusError::Cancelled);
        assert_eq!(engine.calls(), 0);
    }
}

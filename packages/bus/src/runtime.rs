//! ACGS-Bus: Runtime Assembly
//!
//! Builder that wires the whole governed bus together: registry, policy
//! client, scorer, deliberation lane, telemetry pipelines and the
//! antifragility loop. `start` spawns the background workers; `shutdown`
//! drains inboxes and flushes the audit queue within the configured
//! budget.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use acgs_core::{
    AgentRecord, BusConfig, BusError, ConstitutionalValidator, JsonStore, MessageEnvelope,
    ProcessContext,
};
use acgs_deliberation::{
    DeliberationItem, DeliberationQueue, HitlManager, Notifier, VotingService,
};
use acgs_governance::{
    HttpPolicyEngine, ImpactModel, ImpactScorer, KeywordModel, PolicyClient, PolicyEngine,
    RoleRegistry,
};
use acgs_resilience::{
    BreakerRegistry, ChaosInjector, HealthAggregator, RecoveryOrchestrator, RecoveryStrategy,
};
use acgs_telemetry::{
    AuditPipeline, AuditSink, MemoryAuditSink, MemoryMeteringSink, MeteringQueue, MeteringSink,
};

use crate::bus::{AgentBus, AgentHandle, DeadLetter};
use crate::processor::{MessageProcessor, ProcessOutcome};
use crate::worker::DeliberationWorker;

/// Dependency name of the policy engine breaker.
pub const POLICY_ENGINE: &str = "policy-engine";

/// Notifier that only logs; the default until a webhook is configured.
struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, item: &DeliberationItem) -> Result<(), BusError> {
        tracing::info!(
            item_id = %item.item_id,
            score = item.impact_score,
            "deliberation item awaiting human review"
        );
        Ok(())
    }
}

/// Engine used when none is configured: allows everything, so governance
/// rests on the constitutional, role and routing layers.
struct PermissiveEngine;

#[async_trait::async_trait]
impl PolicyEngine for PermissiveEngine {
    async fn evaluate(
        &self,
        _policy_path: &str,
        _input: &serde_json::Value,
    ) -> Result<acgs_governance::EngineResponse, BusError> {
        Ok(acgs_governance::EngineResponse {
            decision: acgs_governance::EngineVerdict::Allow,
            violations: Vec::new(),
            metadata: serde_json::Value::Null,
        })
    }
}

/// Builder for [`EnhancedAgentBus`].
pub struct BusBuilder {
    config: BusConfig,
    engine: Option<Arc<dyn PolicyEngine>>,
    model: Option<Arc<dyn ImpactModel>>,
    notifier: Option<Arc<dyn Notifier>>,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    metering_sink: Option<Arc<dyn MeteringSink>>,
    state_dir: Option<std::path::PathBuf>,
}

impl BusBuilder {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            engine: None,
            model: None,
            notifier: None,
            audit_sinks: Vec::new(),
            metering_sink: None,
            state_dir: None,
        }
    }

    pub fn with_policy_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_policy_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.engine = Some(Arc::new(HttpPolicyEngine::new(endpoint)));
        self
    }

    pub fn with_impact_model(mut self, model: Arc<dyn ImpactModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    pub fn with_metering_sink(mut self, sink: Arc<dyn MeteringSink>) -> Self {
        self.metering_sink = Some(sink);
        self
    }

    /// Directory for the durable state (deliberation items, dead letters).
    pub fn with_state_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<EnhancedAgentBus, BusError> {
        let config = self.config;
        config.validate()?;
        let canonical = config.canonical_hash()?;

        let chaos = Arc::new(ChaosInjector::from_config(
            config.environment,
            config.chaos.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let roles = Arc::new(if config.strict_role_mode {
            RoleRegistry::strict()
        } else {
            RoleRegistry::loose(config.default_role)
        });

        let audit_sinks = if self.audit_sinks.is_empty() {
            vec![Arc::new(MemoryAuditSink::new("memory")) as Arc<dyn AuditSink>]
        } else {
            self.audit_sinks
        };
        let audit = Arc::new(
            AuditPipeline::new(config.audit.clone(), audit_sinks, breakers.clone())
                .with_chaos(chaos.clone()),
        );
        let metering_sink = self
            .metering_sink
            .unwrap_or_else(|| Arc::new(MemoryMeteringSink::new()));
        let metering = Arc::new(MeteringQueue::new(
            &config.metering,
            metering_sink,
            breakers.clone(),
        ));

        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(PermissiveEngine));
        let policy = Arc::new(
            PolicyClient::new(
                engine,
                breakers.breaker(POLICY_ENGINE),
                &config.cache,
                config.fail_closed,
                Duration::from_millis(config.timeouts.policy_ms),
            )
            .with_chaos(chaos.clone()),
        );

        let model = self
            .model
            .unwrap_or_else(|| Arc::new(KeywordModel::default()));
        let scorer = Arc::new(ImpactScorer::new(
            model,
            config.scoring.clone(),
            Duration::from_millis(config.timeouts.score_ms),
        ));

        let deliberations = match &self.state_dir {
            Some(dir) => {
                let store: Arc<JsonStore<DeliberationItem>> =
                    Arc::new(JsonStore::open(dir.join("deliberation.jsonl"))?);
                Arc::new(DeliberationQueue::durable(store)?)
            }
            None => Arc::new(DeliberationQueue::in_memory()),
        };

        let mut bus = AgentBus::new(config.clone(), roles.clone());
        if let Some(dir) = &self.state_dir {
            let store: Arc<JsonStore<DeadLetter>> =
                Arc::new(JsonStore::open(dir.join("dead_letter.jsonl"))?);
            bus = bus.with_dead_letter_store(store);
        }
        let bus = Arc::new(bus);

        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let hitl = Arc::new(HitlManager::new(
            deliberations.clone(),
            notifier,
            config.deliberation.total_critics,
        ));
        let voting = Arc::new(VotingService::new(
            deliberations.clone(),
            config.deliberation.total_critics,
        ));

        let processor = Arc::new(
            MessageProcessor::new(
                config.clone(),
                ConstitutionalValidator::new(canonical),
                roles.clone(),
                policy,
                scorer,
                bus.clone(),
                deliberations.clone(),
                audit.clone(),
                metering.clone(),
            )
            .with_chaos(chaos.clone()),
        );

        let worker = Arc::new(DeliberationWorker::new(
            deliberations.clone(),
            hitl.clone(),
            bus.clone(),
            audit.clone(),
            config.constitutional_hash.clone(),
        ));

        let audit_for_health = audit.clone();
        let metering_for_health = metering.clone();
        let health = Arc::new(
            HealthAggregator::new(breakers.clone()).with_drop_counter(Arc::new(move || {
                audit_for_health.dropped() + metering_for_health.dropped()
            })),
        );
        let recovery = Arc::new(RecoveryOrchestrator::new(breakers.clone()));

        Ok(EnhancedAgentBus {
            config,
            bus,
            processor,
            deliberations,
            voting,
            hitl,
            worker,
            audit,
            metering,
            breakers,
            health,
            recovery,
            chaos,
            roles,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The assembled, constitutionally-governed agent bus.
pub struct EnhancedAgentBus {
    config: BusConfig,
    pub bus: Arc<AgentBus>,
    pub processor: Arc<MessageProcessor>,
    pub deliberations: Arc<DeliberationQueue>,
    pub voting: Arc<VotingService>,
    pub hitl: Arc<HitlManager>,
    pub worker: Arc<DeliberationWorker>,
    pub audit: Arc<AuditPipeline>,
    pub metering: Arc<MeteringQueue>,
    pub breakers: Arc<BreakerRegistry>,
    pub health: Arc<HealthAggregator>,
    pub recovery: Arc<RecoveryOrchestrator>,
    pub chaos: Arc<ChaosInjector>,
    pub roles: Arc<RoleRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EnhancedAgentBus {
    pub fn builder(config: BusConfig) -> BusBuilder {
        BusBuilder::new(config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register an agent and hand back its inbox.
    pub fn register(&self, record: AgentRecord) -> Result<AgentHandle, BusError> {
        self.bus.register(record)
    }

    /// Process one message with a fresh fast-path budget.
    pub async fn process(&self, msg: MessageEnvelope) -> ProcessOutcome {
        let ctx = ProcessContext::with_budget(Duration::from_secs(
            self.config.deliberation.fast_budget_secs,
        ));
        self.processor.process(&ctx, msg).await
    }

    /// Process under a caller-supplied context (deadline/cancellation).
    pub async fn process_with(
        &self,
        ctx: &ProcessContext,
        msg: MessageEnvelope,
    ) -> ProcessOutcome {
        self.processor.process(ctx, msg).await
    }

    /// Spawn the background machinery: health fold, recovery loop, audit
    /// and metering flushers, deliberation worker, and the degraded-
    /// dependency watcher that schedules recovery for opened breakers.
    pub fn start(&self) {
        self.bus.start();
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(self.health.clone().run()));
        tasks.push(tokio::spawn(self.audit.clone().run()));
        tasks.push(tokio::spawn(
            self.metering
                .clone()
                .run(Duration::from_millis(200), 64),
        ));
        tasks.push(tokio::spawn(
            self.worker.clone().run(Duration::from_millis(100)),
        ));
        tasks.push(tokio::spawn(
            self.recovery.clone().run(Duration::from_millis(100)),
        ));

        // Degraded components get a recovery task automatically.
        let health = self.health.clone();
        let recovery = self.recovery.clone();
        let base_ms = self.config.breaker.cooldown_base_ms;
        tasks.push(tokio::spawn(async move {
            let mut rx = health.subscribe();
            while rx.changed().await.is_ok() {
                let open = rx.borrow().open_breakers.clone();
                for dependency in open {
                    recovery.ensure_scheduled(
                        &dependency,
                        5,
                        RecoveryStrategy::ExponentialBackoff {
                            base_ms,
                            max_attempts: 8,
                        },
                    );
                }
            }
        }));

        tracing::info!("enhanced agent bus started");
    }

    /// Graceful shutdown: stop workers, drain inboxes within the budget,
    /// flush the audit tail.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.bus
            .shutdown(Duration::from_secs(self.config.timeouts.shutdown_secs))
            .await;
        self.audit.flush_all().await;
        tracing::info!("enhanced agent bus stopped");
    }
}

//! ACGS-Bus: Agent Registry & Dispatch
//!
//! Registration, bounded per-agent inboxes, topic fan-out, per-role rate
//! limits and dead-lettering. Inboxes are bus-owned queues so a graceful
//! shutdown can drain what receivers never consumed.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use acgs_core::{AgentRecord, AgentStatus, BusConfig, BusError, JsonStore, MessageEnvelope};
use acgs_governance::RoleRegistry;

/// A dead-lettered message with the reason it terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: MessageEnvelope,
    pub reason: String,
    pub dead_lettered_at: chrono::DateTime<Utc>,
}

struct Inbox {
    queue: Mutex<VecDeque<MessageEnvelope>>,
    notify: Notify,
    capacity: usize,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn try_push(&self, msg: MessageEnvelope) -> Result<(), MessageEnvelope> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(msg);
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<MessageEnvelope> {
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn drain(&self) -> Vec<MessageEnvelope> {
        self.queue.lock().drain(..).collect()
    }
}

/// Receiver half handed to an agent at registration.
pub struct AgentHandle {
    agent_id: String,
    inbox: Arc<Inbox>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<MessageEnvelope> {
        self.inbox.try_pop()
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> MessageEnvelope {
        loop {
            if let Some(msg) = self.inbox.try_pop() {
                return msg;
            }
            self.inbox.notify.notified().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

/// Simple token bucket; refilled continuously at the configured rate.
struct TokenBucket {
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        Self {
            tokens: rate_per_sec as f64,
            rate_per_sec: rate_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct AgentEntry {
    record: AgentRecord,
    inbox: Arc<Inbox>,
}

/// Bus counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub delivered: u64,
    pub backpressured: u64,
    pub dead_lettered: u64,
    pub broadcasts: u64,
}

/// The agent bus (C13).
pub struct AgentBus {
    config: BusConfig,
    roles: Arc<RoleRegistry>,
    agents: RwLock<HashMap<String, AgentEntry>>,
    topics: RwLock<HashMap<String, HashSet<String>>>,
    rate_limiters: Mutex<HashMap<String, TokenBucket>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    dead_letter_store: Option<Arc<JsonStore<DeadLetter>>>,
    running: AtomicBool,
    delivered: AtomicU64,
    backpressured: AtomicU64,
    dead_lettered: AtomicU64,
    broadcasts: AtomicU64,
}

impl AgentBus {
    pub fn new(config: BusConfig, roles: Arc<RoleRegistry>) -> Self {
        Self {
            config,
            roles,
            agents: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            rate_limiters: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            dead_letter_store: None,
            running: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            backpressured: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
        }
    }

    /// Persist dead letters to a JSON store.
    pub fn with_dead_letter_store(mut self, store: Arc<JsonStore<DeadLetter>>) -> Self {
        self.dead_letter_store = Some(store);
        self
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("agent bus started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register an agent: records its role and hands back the inbox.
    pub fn register(&self, record: AgentRecord) -> Result<AgentHandle, BusError> {
        let mut agents = self.agents.write();
        if agents.contains_key(&record.agent_id) {
            return Err(BusError::internal(format!(
                "agent {} already registered",
                record.agent_id
            )));
        }
        let inbox = Arc::new(Inbox::new(self.config.inbox_capacity));
        let handle = AgentHandle {
            agent_id: record.agent_id.clone(),
            inbox: inbox.clone(),
        };
        self.roles.assign(&record.agent_id, record.role);
        let rate = self.config.rate_limits.for_role(record.role);
        self.rate_limiters
            .lock()
            .insert(record.agent_id.clone(), TokenBucket::new(rate));
        tracing::info!(agent_id = %record.agent_id, role = record.role.name(), "agent registered");
        let mut record = record;
        record.status = AgentStatus::Active;
        agents.insert(record.agent_id.clone(), AgentEntry { record, inbox });
        Ok(handle)
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).map(|e| e.record.clone())
    }

    pub fn agents(&self) -> Vec<AgentRecord> {
        self.agents.read().values().map(|e| e.record.clone()).collect()
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), BusError> {
        let mut agents = self.agents.write();
        match agents.get_mut(agent_id) {
            Some(entry) => {
                entry.record.status = status;
                Ok(())
            }
            None => Err(BusError::internal(format!("unknown agent {agent_id}"))),
        }
    }

    /// Refresh an agent's `last_seen_at`.
    pub fn touch(&self, agent_id: &str) {
        if let Some(entry) = self.agents.write().get_mut(agent_id) {
            entry.record.last_seen_at = Utc::now();
        }
    }

    /// Subscribe an agent to a topic.
    pub fn subscribe(&self, agent_id: &str, topic: impl Into<String>) -> Result<(), BusError> {
        if !self.agents.read().contains_key(agent_id) {
            return Err(BusError::internal(format!("unknown agent {agent_id}")));
        }
        self.topics
            .write()
            .entry(topic.into())
            .or_default()
            .insert(agent_id.to_string());
        Ok(())
    }

    /// Sender-side admission: lifecycle gate and rate limit.
    pub fn admit_sender(&self, msg: &MessageEnvelope) -> Result<(), BusError> {
        let agents = self.agents.read();
        let entry = agents.get(&msg.from_agent).ok_or_else(|| {
            BusError::RoleViolation {
                agent_id: msg.from_agent.clone(),
                action: "SEND_UNREGISTERED".to_string(),
            }
        })?;
        if !entry.record.admits(msg.message_type) {
            return Err(BusError::RoleViolation {
                agent_id: msg.from_agent.clone(),
                action: "SEND_WHILE_SUSPENDED".to_string(),
            });
        }
        drop(agents);

        let allowed = self
            .rate_limiters
            .lock()
            .get_mut(&msg.from_agent)
            .map(|bucket| bucket.allow())
            .unwrap_or(true);
        if !allowed {
            self.backpressured.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::Backpressure {
                agent_id: msg.from_agent.clone(),
            });
        }
        Ok(())
    }

    /// Point-to-point delivery into the recipient's inbox. `Backpressure`
    /// on a full inbox; already-accepted messages are never dropped.
    pub fn deliver(&self, msg: MessageEnvelope) -> Result<(), BusError> {
        let agents = self.agents.read();
        let entry = agents
            .get(&msg.to_agent)
            .ok_or_else(|| BusError::internal(format!("unknown recipient {}", msg.to_agent)))?;
        if !entry.record.admits(msg.message_type) {
            return Err(BusError::RoleViolation {
                agent_id: msg.to_agent.clone(),
                action: "RECEIVE_WHILE_SUSPENDED".to_string(),
            });
        }
        let inbox = entry.inbox.clone();
        drop(agents);

        match inbox.try_push(msg) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(msg) => {
                self.backpressured.fetch_add(1, Ordering::Relaxed);
                Err(BusError::Backpressure {
                    agent_id: msg.to_agent,
                })
            }
        }
    }

    /// Topic fan-out: one copy per subscriber. Full inboxes are skipped
    /// (counted), other subscribers still receive theirs.
    pub fn broadcast(&self, topic: &str, msg: &MessageEnvelope) -> usize {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        let subscribers: Vec<String> = self
            .topics
            .read()
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for subscriber in subscribers {
            if subscriber == msg.from_agent {
                continue;
            }
            let mut copy = msg.clone();
            copy.to_agent = subscriber;
            if self.deliver(copy).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Record a terminally failed message.
    pub fn dead_letter(&self, message: MessageEnvelope, reason: impl Into<String>) {
        let letter = DeadLetter {
            message,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        };
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        if let Some(store) = &self.dead_letter_store {
            if let Err(err) = store.append(&letter) {
                tracing::error!(error = %err, "dead letter persistence failed");
            }
        }
        tracing::warn!(
            message_id = %letter.message.message_id,
            reason = %letter.reason,
            "message dead-lettered"
        );
        self.dead_letters.lock().push(letter);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    /// Graceful shutdown: stop accepting, give receivers until `deadline`
    /// to drain, then dead-letter whatever is left.
    pub async fn shutdown(&self, drain_budget: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + drain_budget;

        loop {
            let pending: usize = self
                .agents
                .read()
                .values()
                .map(|entry| entry.inbox.len())
                .sum();
            if pending == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let inboxes: Vec<Arc<Inbox>> = self
            .agents
            .read()
            .values()
            .map(|entry| entry.inbox.clone())
            .collect();
        for inbox in inboxes {
            for msg in inbox.drain() {
                self.dead_letter(msg, "undrained at shutdown");
            }
        }
        tracing::info!("agent bus stopped");
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            backpressured: self.backpressured.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acgs_core::{MessageType, Priority, Role};

    const HASH: &str = "cdd01ef066bc6cf2";

    fn bus() -> AgentBus {
        let mut config = BusConfig::default();
        config.inbox_capacity = 4;
        AgentBus::new(config, Arc::new(RoleRegistry::strict()))
    }

    fn msg(from: &str, to: &str) -> MessageEnvelope {
        MessageEnvelope::new(from, to, MessageType::Query, HASH)
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        let handle = bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();

        bus.deliver(msg("a", "b")).unwrap();
        let received = handle.recv().await;
        assert_eq!(received.from_agent, "a");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        assert!(bus.register(AgentRecord::new("a", Role::Judicial)).is_err());
    }

    #[tokio::test]
    async fn test_inbox_full_backpressure() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        let handle = bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();

        for _ in 0..4 {
            bus.deliver(msg("a", "b")).unwrap();
        }
        let err = bus.deliver(msg("a", "b")).unwrap_err();
        assert!(matches!(err, BusError::Backpressure { .. }));
        // Accepted messages survive the overflow
        assert_eq!(handle.pending(), 4);
    }

    #[tokio::test]
    async fn test_fifo_per_inbox() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        let handle = bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();

        let first = msg("a", "b").with_content("n", serde_json::json!(1));
        let second = msg("a", "b").with_content("n", serde_json::json!(2));
        bus.deliver(first.clone()).unwrap();
        bus.deliver(second).unwrap();

        assert_eq!(handle.recv().await.message_id, first.message_id);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let bus = bus();
        bus.register(AgentRecord::new("pub", Role::Executive)).unwrap();
        let sub1 = bus.register(AgentRecord::new("sub1", Role::Judicial)).unwrap();
        let sub2 = bus.register(AgentRecord::new("sub2", Role::Legislative)).unwrap();
        bus.subscribe("sub1", "governance").unwrap();
        bus.subscribe("sub2", "governance").unwrap();

        let delivered = bus.broadcast("governance", &msg("pub", "governance"));
        assert_eq!(delivered, 2);
        assert_eq!(sub1.recv().await.to_agent, "sub1");
        assert_eq!(sub2.recv().await.to_agent, "sub2");
    }

    #[tokio::test]
    async fn test_suspended_recipient_refused() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();
        bus.set_status("b", AgentStatus::Suspended).unwrap();

        assert!(bus.deliver(msg("a", "b")).is_err());
        // Heartbeats still pass
        let hb = MessageEnvelope::new("a", "b", MessageType::Heartbeat, HASH);
        assert!(bus.deliver(hb).is_ok());
    }

    #[tokio::test]
    async fn test_suspended_sender_refused() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();
        bus.set_status("a", AgentStatus::Suspended).unwrap();

        let err = bus.admit_sender(&msg("a", "b")).unwrap_err();
        assert!(matches!(err, BusError::RoleViolation { .. }));
    }

    #[tokio::test]
    async fn test_rate_limit_backpressure() {
        let mut config = BusConfig::default();
        config.rate_limits.executive_per_sec = 2;
        let bus = AgentBus::new(config, Arc::new(RoleRegistry::strict()));
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();

        assert!(bus.admit_sender(&msg("a", "b")).is_ok());
        assert!(bus.admit_sender(&msg("a", "b")).is_ok());
        let err = bus.admit_sender(&msg("a", "b")).unwrap_err();
        assert!(matches!(err, BusError::Backpressure { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_dead_letters_undrained() {
        let bus = bus();
        bus.register(AgentRecord::new("a", Role::Executive)).unwrap();
        let _handle = bus.register(AgentRecord::new("b", Role::Judicial)).unwrap();
        bus.start();

        bus.deliver(msg("a", "b")).unwrap();
        bus.shutdown(Duration::from_millis(20)).await;

        assert!(!bus.is_running());
        assert_eq!(bus.dead_letters().len(), 1);
        assert_eq!(bus.dead_letters()[0].reason, "undrained at shutdown");
    }

    #[tokio::test]
    async fn test_dead_letter_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<JsonStore<DeadLetter>> =
            Arc::new(JsonStore::open(dir.path().join("dead.jsonl")).unwrap());
        let bus = AgentBus::new(BusConfig::default(), Arc::new(RoleRegistry::strict()))
            .with_dead_letter_store(store.clone());

        bus.dead_letter(
            msg("a", "b").with_priority(Priority::High),
            "policy rejection",
        );
        let persisted = store.load().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].reason, "policy rejection");
    }
}

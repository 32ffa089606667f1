//! Agent Registry
//!
//! Tracks execution agents, their liveness and their current assignment.
//!
//! Heartbeats and status reads touch only per-agent atomics. Assignment,
//! release and the liveness sweep run under one coarse dispatch lock so two
//! dispatches can never pick the same idle agent.

use chrono::{DateTime, Utc};
use quay_core::domain::agent::{Agent, AgentStatus};
use quay_core::domain::event::EventDraft;
use quay_core::dto::agent::{Heartbeat, HeartbeatAck, RegisterAgent};
use quay_core::topic::{Topic, is_valid_segment, topics};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::Config;
use crate::service::event_bus::EventBus;

/// Service error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent {0} is already registered")]
    DuplicateAgent(String),

    #[error("no idle agent satisfies the requirement {0:?}")]
    NoEligibleAgent(Vec<String>),

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// An agent that missed its heartbeats, and the step taken back from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTimeout {
    pub agent_id: String,
    pub step_id: Option<Uuid>,
}

/// Outcome of one liveness sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub timeouts: Vec<AgentTimeout>,
    pub removed: Vec<String>,
}

/// Lock-free agent status cell
struct AtomicAgentStatus(AtomicU8);

impl AtomicAgentStatus {
    fn new(status: AgentStatus) -> Self {
        Self(AtomicU8::new(Self::encode(status)))
    }

    fn encode(status: AgentStatus) -> u8 {
        match status {
            AgentStatus::Registering => 0,
            AgentStatus::Idle => 1,
            AgentStatus::Busy => 2,
            AgentStatus::Disconnected => 3,
        }
    }

    fn decode(value: u8) -> AgentStatus {
        match value {
            0 => AgentStatus::Registering,
            1 => AgentStatus::Idle,
            2 => AgentStatus::Busy,
            _ => AgentStatus::Disconnected,
        }
    }

    fn load(&self) -> AgentStatus {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    fn store(&self, status: AgentStatus) {
        self.0.store(Self::encode(status), Ordering::Release);
    }

    /// Swap `from` for `to`; false if the status was something else
    fn transition(&self, from: AgentStatus, to: AgentStatus) -> bool {
        self.0
            .compare_exchange(
                Self::encode(from),
                Self::encode(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct AgentEntry {
    id: String,
    capabilities: BTreeSet<String>,
    registered_at: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,
    disconnected_at_ms: AtomicI64,
    status: AtomicAgentStatus,
    assigned_step: Mutex<Option<Uuid>>,
    pending_cancel: Mutex<Option<Uuid>>,
}

impl AgentEntry {
    fn assigned(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.assigned_step
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_cancel(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.pending_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn last_heartbeat(&self) -> DateTime<Utc> {
        from_millis(self.last_heartbeat_ms.load(Ordering::Acquire))
    }

    fn is_eligible(&self, requirement: &[String]) -> bool {
        self.status.load() == AgentStatus::Idle
            && requirement.iter().all(|r| self.capabilities.contains(r))
    }

    fn snapshot(&self) -> Agent {
        Agent {
            id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            registered_at: self.registered_at,
            last_heartbeat_at: self.last_heartbeat(),
            status: self.status.load(),
            assigned_step: *self.assigned(),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn exceeds(now: DateTime<Utc>, since_ms: i64, limit: Duration) -> bool {
    let limit_ms = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(since_ms) > limit_ms
}

struct RegistryInner {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    dispatch: Mutex<()>,
    bus: EventBus,
    heartbeat_timeout: Duration,
    disconnected_retention: Duration,
    available: Arc<Notify>,
}

/// Registry of execution agents. Cheap to clone.
#[derive(Clone)]
pub struct AgentRegistry {
    inner: Arc<RegistryInner>,
}

impl AgentRegistry {
    pub fn new(bus: EventBus, heartbeat_timeout: Duration, disconnected_retention: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                agents: RwLock::new(HashMap::new()),
                dispatch: Mutex::new(()),
                bus,
                heartbeat_timeout,
                disconnected_retention,
                available: Arc::new(Notify::new()),
            }),
        }
    }

    pub fn from_config(bus: EventBus, config: &Config) -> Self {
        Self::new(
            bus,
            config.heartbeat_timeout(),
            config.disconnected_retention,
        )
    }

    /// Signalled whenever an agent may have become available for work
    pub fn availability(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.available)
    }

    fn dispatch_lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, agent_id: &str) -> Result<Arc<AgentEntry>> {
        self.inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))
    }

    fn emit(&self, topic: Topic, payload: serde_json::Value) {
        if let Err(e) = self.inner.bus.publish(EventDraft::system(topic, payload)) {
            tracing::warn!("Failed to publish agent event: {}", e);
        }
    }

    /// Register an agent
    ///
    /// A Disconnected agent may register again under the same id; its old
    /// entry is replaced.
    pub fn register_agent(&self, req: RegisterAgent) -> Result<Agent> {
        validate_register_request(&req)?;

        let now = Utc::now();
        let entry = Arc::new(AgentEntry {
            id: req.agent_id.clone(),
            capabilities: req.capabilities.into_iter().collect(),
            registered_at: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            disconnected_at_ms: AtomicI64::new(0),
            status: AtomicAgentStatus::new(AgentStatus::Registering),
            assigned_step: Mutex::new(None),
            pending_cancel: Mutex::new(None),
        });

        {
            let mut agents = self
                .inner
                .agents
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let live = agents
                .get(&req.agent_id)
                .is_some_and(|existing| existing.status.load() != AgentStatus::Disconnected);
            if live {
                return Err(AgentError::DuplicateAgent(req.agent_id));
            }
            agents.insert(req.agent_id.clone(), Arc::clone(&entry));
        }

        entry.status.store(AgentStatus::Idle);

        tracing::info!("Agent registered: {}", entry.id);
        self.emit(
            topics::agent("registered"),
            json!({ "agent_id": entry.id, "capabilities": entry.capabilities }),
        );
        self.inner.available.notify_one();

        Ok(entry.snapshot())
    }

    /// Record a heartbeat now
    pub fn heartbeat(&self, agent_id: &str, heartbeat: Heartbeat) -> Result<HeartbeatAck> {
        self.heartbeat_at(agent_id, heartbeat, Utc::now())
    }

    /// Record a heartbeat at `at`
    ///
    /// Only a Disconnected agent changes status here, back to Idle. The reply
    /// carries any cancellation waiting for the agent.
    pub fn heartbeat_at(
        &self,
        agent_id: &str,
        heartbeat: Heartbeat,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatAck> {
        let entry = self.entry(agent_id)?;
        entry
            .last_heartbeat_ms
            .store(at.timestamp_millis(), Ordering::Release);

        if entry
            .status
            .transition(AgentStatus::Disconnected, AgentStatus::Idle)
        {
            tracing::info!("Agent reconnected: {}", agent_id);
            self.emit(
                topics::agent_scoped(agent_id, "reconnected"),
                json!({ "agent_id": agent_id }),
            );
            self.inner.available.notify_one();
        }

        tracing::debug!("Heartbeat received from agent: {}", agent_id);
        self.emit(
            topics::agent_scoped(agent_id, "heartbeat"),
            json!({ "agent_id": agent_id, "metrics": heartbeat.metrics }),
        );

        Ok(HeartbeatAck {
            status: entry.status.load(),
            assigned_step: *entry.assigned(),
            cancel_step: entry.pending_cancel().take(),
        })
    }

    /// Pick an idle agent for a step
    ///
    /// The agent must advertise every label in `requirement`. Among eligible
    /// agents the one with the oldest heartbeat wins, ties broken by id.
    pub fn assign_step(&self, step_id: Uuid, requirement: &[String]) -> Result<String> {
        let _dispatch = self.dispatch_lock();

        let chosen = {
            let agents = self
                .inner
                .agents
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            agents
                .values()
                .filter(|a| a.is_eligible(requirement))
                .min_by(|a, b| {
                    a.last_heartbeat_ms
                        .load(Ordering::Acquire)
                        .cmp(&b.last_heartbeat_ms.load(Ordering::Acquire))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .cloned()
        };

        let Some(agent) = chosen else {
            return Err(AgentError::NoEligibleAgent(requirement.to_vec()));
        };

        agent.status.store(AgentStatus::Busy);
        *agent.assigned() = Some(step_id);

        tracing::debug!("Step {} assigned to agent {}", step_id, agent.id);
        self.emit(
            topics::agent_scoped(&agent.id, "assigned"),
            json!({ "agent_id": agent.id, "step_id": step_id }),
        );

        Ok(agent.id.clone())
    }

    /// Free an agent from a step it holds. Returns false if it did not hold it.
    pub fn release(&self, agent_id: &str, step_id: Uuid) -> bool {
        let _dispatch = self.dispatch_lock();
        let Ok(entry) = self.entry(agent_id) else {
            return false;
        };

        {
            let mut assigned = entry.assigned();
            if *assigned != Some(step_id) {
                return false;
            }
            *assigned = None;
        }
        entry.pending_cancel().take_if(|pending| *pending == step_id);
        entry.status.transition(AgentStatus::Busy, AgentStatus::Idle);

        tracing::debug!("Agent {} released from step {}", agent_id, step_id);
        self.emit(
            topics::agent_scoped(agent_id, "released"),
            json!({ "agent_id": agent_id, "step_id": step_id }),
        );
        self.inner.available.notify_one();
        true
    }

    /// Leave a cancellation for the agent holding `step_id`, delivered with
    /// its next heartbeat acknowledgement
    pub fn request_cancel(&self, agent_id: &str, step_id: Uuid) -> Result<()> {
        let entry = self.entry(agent_id)?;
        if *entry.assigned() == Some(step_id) {
            *entry.pending_cancel() = Some(step_id);
        }
        Ok(())
    }

    /// Remove an agent. Returns the step it was holding, if any.
    pub fn deregister(&self, agent_id: &str) -> Result<Option<Uuid>> {
        let _dispatch = self.dispatch_lock();
        let entry = self
            .inner
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .ok_or_else(|| AgentError::AgentNotFound(agent_id.to_string()))?;

        let step_id = entry.assigned().take();

        tracing::info!("Agent deregistered: {}", agent_id);
        self.emit(
            topics::agent("deregistered"),
            json!({ "agent_id": agent_id, "step_id": step_id }),
        );
        Ok(step_id)
    }

    /// Disconnect agents whose heartbeat is too old and remove agents that
    /// stayed disconnected past the retention window.
    ///
    /// A disconnected agent's step is taken from it here and reported once;
    /// a later sweep finds nothing left to report.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let _dispatch = self.dispatch_lock();
        let mut report = SweepReport::default();

        let entries: Vec<Arc<AgentEntry>> = self
            .inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for entry in entries {
            match entry.status.load() {
                AgentStatus::Disconnected => {
                    let since = entry.disconnected_at_ms.load(Ordering::Acquire);
                    if exceeds(now, since, self.inner.disconnected_retention) {
                        report.removed.push(entry.id.clone());
                    }
                }
                status => {
                    let last = entry.last_heartbeat_ms.load(Ordering::Acquire);
                    if !exceeds(now, last, self.inner.heartbeat_timeout) {
                        continue;
                    }
                    if !entry.status.transition(status, AgentStatus::Disconnected) {
                        continue;
                    }
                    entry
                        .disconnected_at_ms
                        .store(now.timestamp_millis(), Ordering::Release);

                    let step_id = entry.assigned().take();
                    entry.pending_cancel().take();

                    tracing::warn!(
                        "Agent {} disconnected after missing heartbeats (last seen {})",
                        entry.id,
                        from_millis(last)
                    );
                    self.emit(
                        topics::agent("disconnected"),
                        json!({ "agent_id": entry.id, "step_id": step_id }),
                    );
                    report.timeouts.push(AgentTimeout {
                        agent_id: entry.id.clone(),
                        step_id,
                    });
                }
            }
        }

        if !report.removed.is_empty() {
            let mut agents = self
                .inner
                .agents
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for id in &report.removed {
                agents.remove(id);
            }
        }
        for id in &report.removed {
            tracing::info!("Agent removed after retention window: {}", id);
            self.emit(topics::agent("removed"), json!({ "agent_id": id }));
        }

        report
    }

    /// Get an agent by ID
    pub fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        Ok(self.entry(agent_id)?.snapshot())
    }

    /// List all agents, ordered by id
    pub fn list_agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .inner
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|a| a.snapshot())
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_register_request(req: &RegisterAgent) -> Result<()> {
    if req.agent_id.trim().is_empty() {
        return Err(AgentError::Validation(
            "Agent ID cannot be empty".to_string(),
        ));
    }

    if !is_valid_segment(&req.agent_id) {
        return Err(AgentError::Validation(format!(
            "Agent ID '{}' may only contain letters, digits, '-' and '_' (max 128 characters)",
            req.agent_id
        )));
    }

    if req.capabilities.iter().any(|c| c.trim().is_empty()) {
        return Err(AgentError::Validation(
            "Capability labels cannot be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use quay_core::topic::TopicPattern;

    fn registry() -> (AgentRegistry, EventBus) {
        let bus = EventBus::new(64, 64, OverflowPolicy::DropOldest);
        let registry = AgentRegistry::new(
            bus.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );
        (registry, bus)
    }

    fn register(registry: &AgentRegistry, id: &str, caps: &[&str]) -> Agent {
        registry
            .register_agent(RegisterAgent {
                agent_id: id.to_string(),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
            })
            .unwrap()
    }

    fn labels(caps: &[&str]) -> Vec<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_register_ends_idle() {
        let (registry, bus) = registry();
        let mut events = bus
            .subscribe(TopicPattern::new("agent.registered").unwrap(), None)
            .unwrap();

        let agent = register(&registry, "agent-1", &["linux"]);
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(events.try_recv().unwrap().is_some());
    }

    #[test]
    fn test_register_rejects_live_duplicate() {
        let (registry, _bus) = registry();
        register(&registry, "agent-1", &[]);

        let err = registry
            .register_agent(RegisterAgent {
                agent_id: "agent-1".to_string(),
                capabilities: vec![],
            })
            .unwrap_err();
        assert_eq!(err, AgentError::DuplicateAgent("agent-1".to_string()));
    }

    #[test]
    fn test_register_validates_id() {
        let (registry, _bus) = registry();
        for bad in ["", "has space", "dotted.id"] {
            let err = registry
                .register_agent(RegisterAgent {
                    agent_id: bad.to_string(),
                    capabilities: vec![],
                })
                .unwrap_err();
            assert!(matches!(err, AgentError::Validation(_)));
        }
    }

    #[test]
    fn test_assign_requires_capability_superset() {
        let (registry, _bus) = registry();
        register(&registry, "plain", &["linux"]);
        register(&registry, "docker", &["linux", "docker"]);

        let chosen = registry
            .assign_step(Uuid::new_v4(), &labels(&["linux", "docker"]))
            .unwrap();
        assert_eq!(chosen, "docker");

        let err = registry
            .assign_step(Uuid::new_v4(), &labels(&["docker"]))
            .unwrap_err();
        assert!(matches!(err, AgentError::NoEligibleAgent(_)));
    }

    #[test]
    fn test_assign_prefers_oldest_heartbeat() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        register(&registry, "b", &[]);

        let now = Utc::now();
        registry
            .heartbeat_at("a", Heartbeat::default(), now)
            .unwrap();
        registry
            .heartbeat_at("b", Heartbeat::default(), now - chrono::Duration::seconds(5))
            .unwrap();

        assert_eq!(registry.assign_step(Uuid::new_v4(), &[]).unwrap(), "b");
        // b is busy now
        assert_eq!(registry.assign_step(Uuid::new_v4(), &[]).unwrap(), "a");
        assert!(registry.assign_step(Uuid::new_v4(), &[]).is_err());
    }

    #[test]
    fn test_agent_holds_one_step_until_released() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let step = Uuid::new_v4();

        registry.assign_step(step, &[]).unwrap();
        let agent = registry.get_agent("a").unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.assigned_step, Some(step));

        assert!(!registry.release("a", Uuid::new_v4()));
        assert!(registry.release("a", step));
        assert!(!registry.release("a", step));

        let agent = registry.get_agent("a").unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.assigned_step, None);
    }

    #[test]
    fn test_sweep_disconnects_and_takes_step_once() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let step = Uuid::new_v4();
        registry.assign_step(step, &[]).unwrap();

        let now = Utc::now();
        registry
            .heartbeat_at("a", Heartbeat::default(), now - chrono::Duration::seconds(31))
            .unwrap();

        let report = registry.sweep(now);
        assert_eq!(
            report.timeouts,
            vec![AgentTimeout {
                agent_id: "a".to_string(),
                step_id: Some(step)
            }]
        );
        assert_eq!(
            registry.get_agent("a").unwrap().status,
            AgentStatus::Disconnected
        );

        let again = registry.sweep(now + chrono::Duration::seconds(1));
        assert!(again.timeouts.is_empty());
    }

    #[test]
    fn test_sweep_keeps_agents_within_three_intervals() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let now = Utc::now();
        registry
            .heartbeat_at("a", Heartbeat::default(), now - chrono::Duration::seconds(29))
            .unwrap();

        assert!(registry.sweep(now).timeouts.is_empty());
        assert_eq!(registry.get_agent("a").unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn test_reconnect_and_reregister_after_disconnect() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        register(&registry, "b", &[]);
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(60);
        registry.heartbeat_at("a", Heartbeat::default(), stale).unwrap();
        registry.heartbeat_at("b", Heartbeat::default(), stale).unwrap();
        registry.sweep(now);

        let ack = registry.heartbeat_at("a", Heartbeat::default(), now).unwrap();
        assert_eq!(ack.status, AgentStatus::Idle);

        let again = register(&registry, "b", &["linux"]);
        assert_eq!(again.status, AgentStatus::Idle);
        assert!(again.capabilities.contains("linux"));
    }

    #[test]
    fn test_disconnected_agents_removed_after_retention() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let now = Utc::now();
        registry
            .heartbeat_at("a", Heartbeat::default(), now - chrono::Duration::seconds(60))
            .unwrap();
        registry.sweep(now);

        let report = registry.sweep(now + chrono::Duration::seconds(301));
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert!(matches!(
            registry.get_agent("a"),
            Err(AgentError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_pending_cancel_delivered_once_by_heartbeat() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let step = Uuid::new_v4();
        registry.assign_step(step, &[]).unwrap();

        registry.request_cancel("a", step).unwrap();
        let ack = registry.heartbeat("a", Heartbeat::default()).unwrap();
        assert_eq!(ack.cancel_step, Some(step));

        let ack = registry.heartbeat("a", Heartbeat::default()).unwrap();
        assert_eq!(ack.cancel_step, None);
    }

    #[test]
    fn test_deregister_returns_held_step() {
        let (registry, _bus) = registry();
        register(&registry, "a", &[]);
        let step = Uuid::new_v4();
        registry.assign_step(step, &[]).unwrap();

        assert_eq!(registry.deregister("a").unwrap(), Some(step));
        assert!(registry.list_agents().is_empty());
        assert!(registry.deregister("a").is_err());
    }

    #[test]
    fn test_concurrent_assignments_never_share_an_agent() {
        let (registry, _bus) = registry();
        for i in 0..4 {
            register(&registry, &format!("agent-{i}"), &[]);
        }

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.assign_step(Uuid::new_v4(), &[]).ok())
            })
            .collect();

        let mut assigned: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assigned.sort();
        assigned.dedup();
        assert_eq!(assigned.len(), 4);

        let total = registry
            .list_agents()
            .iter()
            .filter(|a| a.assigned_step.is_some())
            .count();
        assert_eq!(total, 4);
    }
}

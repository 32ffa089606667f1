//! Run State Machine
//!
//! Authoritative lifecycle of every run, stage and step.
//!
//! Every operation on a run works on a copy of the run under the run's lock,
//! collects the events it produces and commits the copy only once all of
//! them were published. A rejected operation therefore leaves the run and
//! its event stream untouched. Work that touches the agent registry
//! (releasing agents, delivering cancellations) happens after the run lock
//! is released, so the only lock taken while a run is held is the
//! registry's dispatch lock.

use chrono::{DateTime, Utc};
use quay_core::domain::event::{EventDraft, OutputChunk};
use quay_core::domain::pipeline::{Pipeline, topological_order};
use quay_core::domain::run::{Run, Stage, Status, Step, StepResult, TriggerMetadata};
use quay_core::topic::{Topic, topics};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::repository::run_repository::{RunHandle, RunStore};
use crate::service::agent::{AgentError, AgentRegistry};
use crate::service::event_bus::EventBus;

/// Service error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: Status,
        to: Status,
    },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("stage '{stage}' not found in run {run_id}")]
    StageNotFound { run_id: Uuid, stage: String },

    #[error("step {0} not found")]
    StepNotFound(Uuid),

    #[error("pipeline '{0}' not found")]
    PipelineNotFound(String),

    #[error("step {step_id} is {status}; output is only accepted while it is started or running")]
    StepNotRunning { step_id: Uuid, status: Status },

    #[error("run {0} is unavailable after an internal inconsistency")]
    RunUnavailable(Uuid),
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Target of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Run(Uuid),
    Stage { run_id: Uuid, stage: String },
    Step(Uuid),
}

const GRACE_EXPIRED: &str = "cancellation not acknowledged within grace period";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dependencies {
    Pending,
    Satisfied,
    Blocked,
}

struct PendingCancel {
    agent_id: String,
    step_id: Uuid,
    attempt: u32,
}

/// Side effects of a committed transition, applied after the run lock is
/// released
#[derive(Default)]
struct Effects {
    releases: Vec<(String, Uuid)>,
    cancels: Vec<PendingCancel>,
    ready: bool,
}

/// A working copy of one run and everything an operation did to it
struct Transition {
    run: Run,
    honor_allow_failure: bool,
    now: DateTime<Utc>,
    events: Vec<EventDraft>,
    assigned: Vec<(String, Uuid)>,
    effects: Effects,
}

fn kind_of(status: Status) -> &'static str {
    match status {
        Status::Queued => "queued",
        Status::Started => "started",
        Status::Running => "running",
        _ => "completed",
    }
}

fn advances(current: Status, next: Status) -> bool {
    !current.is_terminal() && next.progress() > current.progress()
}

/// Status a stage's steps add up to
fn stage_status(steps: &[Step]) -> Status {
    if steps.iter().all(|s| s.status.is_terminal()) {
        return steps
            .iter()
            .map(|s| s.status)
            .fold(Status::Succeeded, Status::worst);
    }

    let progressed = steps.iter().any(|s| {
        s.status == Status::Running || (s.status.is_terminal() && s.started_at.is_some())
    });
    if progressed {
        Status::Running
    } else if steps.iter().any(|s| s.status == Status::Started) {
        Status::Started
    } else {
        Status::Queued
    }
}

impl Transition {
    fn new(run: Run, honor_allow_failure: bool) -> Self {
        Self {
            run,
            honor_allow_failure,
            now: Utc::now(),
            events: Vec::new(),
            assigned: Vec::new(),
            effects: Effects::default(),
        }
    }

    fn emit(&mut self, topic: Topic, payload: serde_json::Value) {
        self.events
            .push(EventDraft::for_run(self.run.id, topic, payload));
    }

    fn locate(&self, step_id: Uuid) -> Option<(usize, usize)> {
        self.run.stages.iter().enumerate().find_map(|(si, stage)| {
            stage
                .steps
                .iter()
                .position(|s| s.id == step_id)
                .map(|ti| (si, ti))
        })
    }

    fn stage_index(&self, name: &str) -> Option<usize> {
        self.run.stages.iter().position(|s| s.name == name)
    }

    fn dependencies(&self, si: usize) -> Dependencies {
        let mut blocked = false;
        for dep in &self.run.stages[si].depends_on {
            let Some(upstream) = self.run.stage(dep) else {
                return Dependencies::Blocked;
            };
            if !upstream.status.is_terminal() {
                return Dependencies::Pending;
            }
            if upstream.skipped
                || upstream.contribution(self.honor_allow_failure) != Some(Status::Succeeded)
            {
                blocked = true;
            }
        }

        if blocked {
            Dependencies::Blocked
        } else {
            Dependencies::Satisfied
        }
    }

    fn emit_step_completed(&mut self, si: usize, ti: usize, extra: Option<(&str, bool)>) {
        let run_id = self.run.id;
        let step = &self.run.stages[si].steps[ti];
        let mut payload = json!({
            "step_id": step.id,
            "stage": step.stage,
            "status": step.status,
            "agent_id": step.agent_id,
            "attempt": step.attempt,
            "result": step.result,
        });
        if let Some((key, value)) = extra {
            payload[key] = json!(value);
        }
        let topic = topics::step(run_id, step.id, "completed");
        self.emit(topic, payload);
    }

    /// Move a held step to a terminal status and free its agent
    fn complete_step(&mut self, si: usize, ti: usize, status: Status, result: Option<StepResult>) {
        let now = self.now;
        let step = &mut self.run.stages[si].steps[ti];
        step.status = status;
        step.completed_at = Some(now);
        if result.is_some() {
            step.result = result;
        }
        if let Some(agent_id) = step.agent_id.clone() {
            self.effects.releases.push((agent_id, step.id));
        }
        self.emit_step_completed(si, ti, None);
    }

    /// Cancel a step: immediately if nobody holds it, otherwise by asking
    /// its agent and starting the grace period
    fn cancel_step(&mut self, si: usize, ti: usize) {
        let run_id = self.run.id;
        let now = self.now;
        let step = &mut self.run.stages[si].steps[ti];

        match step.status {
            Status::Queued => {
                step.status = Status::Cancelled;
                step.completed_at = Some(now);
                self.emit_step_completed(si, ti, None);
            }
            Status::Started | Status::Running if !step.cancel_requested => {
                step.cancel_requested = true;
                let step_id = step.id;
                let attempt = step.attempt;
                let agent_id = step.agent_id.clone();
                if let Some(agent_id) = agent_id.clone() {
                    self.effects.cancels.push(PendingCancel {
                        agent_id,
                        step_id,
                        attempt,
                    });
                }
                self.emit(
                    topics::step(run_id, step_id, "cancelling"),
                    json!({ "step_id": step_id, "agent_id": agent_id, "attempt": attempt }),
                );
            }
            _ => {}
        }
    }

    fn cancel_stage(&mut self, si: usize) {
        if self.run.stages[si].status.is_terminal() {
            return;
        }

        for ti in 0..self.run.stages[si].steps.len() {
            self.cancel_step(si, ti);
        }

        let run_id = self.run.id;
        let now = self.now;
        let stage = &mut self.run.stages[si];
        stage.status = Status::Cancelled;
        stage.completed_at = Some(now);
        let name = stage.name.clone();
        self.emit(
            topics::stage(run_id, &name, "completed"),
            json!({ "stage": name, "status": Status::Cancelled }),
        );
    }

    /// A stage whose upstream did not succeed never runs
    fn skip_stage(&mut self, si: usize) {
        let now = self.now;
        for ti in 0..self.run.stages[si].steps.len() {
            let step = &mut self.run.stages[si].steps[ti];
            step.status = Status::Cancelled;
            step.completed_at = Some(now);
            self.emit_step_completed(si, ti, Some(("skipped", true)));
        }

        let run_id = self.run.id;
        let stage = &mut self.run.stages[si];
        stage.skipped = true;
        stage.status = Status::Cancelled;
        stage.completed_at = Some(now);
        let name = stage.name.clone();
        tracing::debug!(run_id = %run_id, "Stage {} skipped", name);
        self.emit(
            topics::stage(run_id, &name, "completed"),
            json!({ "stage": name, "status": Status::Cancelled, "skipped": true }),
        );
    }

    fn complete_empty_stage(&mut self, si: usize) {
        let run_id = self.run.id;
        let now = self.now;
        let stage = &mut self.run.stages[si];
        stage.status = Status::Succeeded;
        stage.started_at = Some(now);
        stage.completed_at = Some(now);
        let name = stage.name.clone();
        self.emit(
            topics::stage(run_id, &name, "completed"),
            json!({ "stage": name, "status": Status::Succeeded }),
        );
    }

    /// Recompute a stage from its steps. Returns true if its status changed.
    fn aggregate_stage(&mut self, si: usize) -> bool {
        let stage = &self.run.stages[si];
        if stage.steps.is_empty() {
            return false;
        }
        let next = stage_status(&stage.steps);
        if !advances(stage.status, next) {
            return false;
        }

        let run_id = self.run.id;
        let now = self.now;
        let stage = &mut self.run.stages[si];
        stage.status = next;
        stage.started_at.get_or_insert(now);
        if next.is_terminal() {
            stage.completed_at = Some(now);
        }
        let name = stage.name.clone();
        self.emit(
            topics::stage(run_id, &name, kind_of(next)),
            json!({ "stage": name, "status": next }),
        );
        true
    }

    fn failure_reason(&self, status: Status) -> Option<String> {
        if status == Status::Succeeded {
            return None;
        }

        let stage = self
            .run
            .stages
            .iter()
            .find(|s| s.contribution(self.honor_allow_failure) == Some(status));
        let Some(stage) = stage else {
            return Some("all stages were skipped".to_string());
        };

        let reason = match stage.steps.iter().find(|s| s.status == status) {
            Some(step) => match step.result.as_ref().and_then(|r| r.message.as_deref()) {
                Some(message) => format!(
                    "step '{}' in stage '{}' {}: {}",
                    step.name, stage.name, status, message
                ),
                None => format!("step '{}' in stage '{}' {}", step.name, stage.name, status),
            },
            None => format!("stage '{}' {}", stage.name, status),
        };
        Some(reason)
    }

    fn aggregate_run(&mut self) {
        if self.run.status.is_terminal() {
            return;
        }

        let stages = &self.run.stages;
        let next = if stages.iter().all(|s| s.status.is_terminal()) {
            stages
                .iter()
                .filter_map(|s| s.contribution(self.honor_allow_failure))
                .reduce(Status::worst)
                .unwrap_or(Status::Cancelled)
        } else if stages
            .iter()
            .any(|s| s.status == Status::Running || (s.status.is_terminal() && !s.skipped))
        {
            Status::Running
        } else if stages.iter().any(|s| s.status == Status::Started) {
            Status::Started
        } else {
            Status::Queued
        };

        if !advances(self.run.status, next) {
            return;
        }

        let run_id = self.run.id;
        let reason = if next.is_terminal() {
            self.failure_reason(next)
        } else {
            None
        };

        self.run.status = next;
        self.run.started_at.get_or_insert(self.now);
        let topic = match next {
            Status::Cancelled => topics::run(run_id, "cancelled"),
            status => topics::run(run_id, kind_of(status)),
        };
        if next.is_terminal() {
            self.run.completed_at = Some(self.now);
            self.run.reason = reason.clone();
            tracing::info!(run_id = %run_id, "Run {} ({})", next, reason.as_deref().unwrap_or("ok"));
        }
        self.emit(topic, json!({ "status": next, "reason": reason }));
    }

    /// Bring stages and the run up to date after a change
    fn settle(&mut self) {
        loop {
            let mut changed = false;

            for si in 0..self.run.stages.len() {
                changed |= self.aggregate_stage(si);

                let stage = &self.run.stages[si];
                if stage.status != Status::Queued || stage.skipped {
                    continue;
                }
                let empty = stage.steps.is_empty();
                let has_queued = stage.steps.iter().any(|s| s.status == Status::Queued);

                match self.dependencies(si) {
                    Dependencies::Pending => {}
                    Dependencies::Blocked => {
                        self.skip_stage(si);
                        changed = true;
                    }
                    Dependencies::Satisfied if empty => {
                        self.complete_empty_stage(si);
                        changed = true;
                    }
                    Dependencies::Satisfied => self.effects.ready |= has_queued,
                }
            }

            if !changed {
                break;
            }
        }

        self.aggregate_run();
    }

    fn dispatchable(&self, si: usize) -> bool {
        let stage = &self.run.stages[si];
        !self.run.status.is_terminal()
            && !stage.status.is_terminal()
            && !stage.skipped
            && self.dependencies(si) == Dependencies::Satisfied
    }

    fn has_ready_steps(&self) -> bool {
        (0..self.run.stages.len()).any(|si| {
            self.dispatchable(si)
                && self.run.stages[si]
                    .steps
                    .iter()
                    .any(|s| s.status == Status::Queued)
        })
    }

    /// Offer every ready step to the registry
    fn dispatch(&mut self, agents: &AgentRegistry) -> usize {
        let run_id = self.run.id;
        let mut dispatched = 0;

        for si in 0..self.run.stages.len() {
            if !self.dispatchable(si) {
                continue;
            }

            for ti in 0..self.run.stages[si].steps.len() {
                let step = &self.run.stages[si].steps[ti];
                if step.status != Status::Queued {
                    continue;
                }

                let agent_id = match agents.assign_step(step.id, &step.requires) {
                    Ok(agent_id) => agent_id,
                    Err(AgentError::NoEligibleAgent(_)) => continue,
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, "Dispatch of step {} failed: {}", step.id, e);
                        continue;
                    }
                };

                let now = self.now;
                let step = &mut self.run.stages[si].steps[ti];
                step.status = Status::Started;
                step.agent_id = Some(agent_id.clone());
                step.started_at = Some(now);
                let payload = json!({
                    "step_id": step.id,
                    "name": step.name,
                    "stage": step.stage,
                    "agent_id": agent_id,
                    "attempt": step.attempt,
                    "requires": step.requires,
                    "payload": step.payload,
                });
                let step_id = step.id;
                self.assigned.push((agent_id.clone(), step_id));
                self.emit(topics::step(run_id, step_id, "started"), payload);

                tracing::info!(run_id = %run_id, "Step {} dispatched to agent {}", step_id, agent_id);
                dispatched += 1;
            }
        }

        dispatched
    }
}

struct MachineInner {
    runs: RunStore,
    bus: EventBus,
    agents: AgentRegistry,
    honor_allow_failure: bool,
    cancel_grace: Duration,
    ready: Arc<Notify>,
}

/// Owner of every run's lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct RunStateMachine {
    inner: Arc<MachineInner>,
}

impl RunStateMachine {
    pub fn new(
        bus: EventBus,
        agents: AgentRegistry,
        honor_allow_failure: bool,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MachineInner {
                runs: RunStore::new(),
                bus,
                agents,
                honor_allow_failure,
                cancel_grace,
                ready: Arc::new(Notify::new()),
            }),
        }
    }

    /// Signalled whenever steps may have become ready for dispatch
    pub fn readiness(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.ready)
    }

    fn run_handle(&self, run_id: Uuid) -> Result<RunHandle> {
        self.inner
            .runs
            .find_by_id(run_id)
            .ok_or(RunError::RunNotFound(run_id))
    }

    fn step_handle(&self, step_id: Uuid) -> Result<(Uuid, RunHandle)> {
        self.inner
            .runs
            .find_by_step(step_id)
            .ok_or(RunError::StepNotFound(step_id))
    }

    /// Run `op` against a working copy of the run, then publish its events
    /// and commit the copy.
    fn apply<T, F>(&self, run_id: Uuid, handle: &RunHandle, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transition) -> Result<T>,
    {
        let mut guard = handle
            .lock()
            .map_err(|_| RunError::RunUnavailable(run_id))?;

        let mut txn = Transition::new(guard.clone(), self.inner.honor_allow_failure);
        let value = match op(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                self.rollback_assignments(&txn);
                return Err(e);
            }
        };
        txn.settle();

        let drafts = std::mem::take(&mut txn.events);
        if !drafts.is_empty() {
            match self.inner.bus.publish_all(run_id, drafts) {
                Ok(events) => {
                    if let Some(last) = events.last() {
                        txn.run.sequence = last.sequence;
                    }
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, "Rejecting write, event stream failed: {}", e);
                    self.rollback_assignments(&txn);
                    return Err(RunError::RunUnavailable(run_id));
                }
            }
        }

        let effects = std::mem::take(&mut txn.effects);
        *guard = txn.run;
        drop(guard);

        self.apply_effects(effects);
        Ok(value)
    }

    fn rollback_assignments(&self, txn: &Transition) {
        for (agent_id, step_id) in &txn.assigned {
            self.inner.agents.release(agent_id, *step_id);
        }
    }

    fn apply_effects(&self, effects: Effects) {
        for (agent_id, step_id) in effects.releases {
            self.inner.agents.release(&agent_id, step_id);
        }

        for cancel in effects.cancels {
            if let Err(e) = self
                .inner
                .agents
                .request_cancel(&cancel.agent_id, cancel.step_id)
            {
                tracing::debug!("Cancellation for step {} not delivered: {}", cancel.step_id, e);
            }
            self.schedule_grace_expiry(cancel.step_id, cancel.attempt);
        }

        if effects.ready {
            self.inner.ready.notify_one();
        }
    }

    fn schedule_grace_expiry(&self, step_id: Uuid, attempt: u32) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to schedule cancellation grace for step {}", step_id);
            return;
        };

        let machine = self.clone();
        let grace = self.inner.cancel_grace;
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = machine.expire_cancel(step_id, attempt) {
                tracing::warn!("Cancellation grace expiry for step {} failed: {}", step_id, e);
            }
        });
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create a run from a pipeline snapshot
    ///
    /// Every stage and step is created up front in Queued. Stages are stored
    /// in dependency order.
    pub fn create_run(&self, pipeline: Arc<Pipeline>, trigger: TriggerMetadata) -> Result<Run> {
        let order = topological_order(&pipeline.stages)
            .map_err(|e| RunError::InvalidPipeline(e.to_string()))?;

        let now = Utc::now();
        let stages = order
            .into_iter()
            .map(|i| {
                let def = &pipeline.stages[i];
                Stage {
                    name: def.name.clone(),
                    depends_on: def.depends_on.clone(),
                    allow_failure: def.allow_failure,
                    skipped: false,
                    status: Status::Queued,
                    started_at: None,
                    completed_at: None,
                    steps: def
                        .steps
                        .iter()
                        .map(|s| Step {
                            id: Uuid::new_v4(),
                            name: s.name.clone(),
                            stage: def.name.clone(),
                            requires: s.requires.clone(),
                            payload: s.payload.clone(),
                            status: Status::Queued,
                            agent_id: None,
                            attempt: 0,
                            cancel_requested: false,
                            output_chunks: 0,
                            last_output_sequence: 0,
                            result: None,
                            started_at: None,
                            completed_at: None,
                        })
                        .collect(),
                }
            })
            .collect();

        let run = Run {
            id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            pipeline_version: pipeline.version,
            trigger,
            status: Status::Queued,
            reason: None,
            sequence: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            stages,
        };

        let run_id = run.id;
        let handle = self.inner.runs.create(run);

        let created = self.apply(run_id, &handle, |txn| {
            let payload = json!({
                "pipeline": txn.run.pipeline_name,
                "version": txn.run.pipeline_version,
                "commit": txn.run.trigger.commit,
                "source": txn.run.trigger.source,
                "step_count": txn.run.step_count(),
            });
            txn.emit(topics::run(run_id, "queued"), payload);
            Ok(())
        });
        if let Err(e) = created {
            self.inner.runs.delete(run_id);
            return Err(e);
        }

        tracing::info!(
            run_id = %run_id,
            "Run created for pipeline {} v{}",
            pipeline.name,
            pipeline.version
        );
        self.get_run(run_id)
    }

    /// Apply a status reported by the agent holding a step
    ///
    /// Only Running and terminal statuses can be reported; dispatch is what
    /// starts a step. A step under cancellation that finishes in any way but
    /// Errored is recorded as Cancelled.
    pub fn report_step_transition(
        &self,
        step_id: Uuid,
        status: Status,
        result: Option<StepResult>,
    ) -> Result<Step> {
        let (run_id, handle) = self.step_handle(step_id)?;

        self.apply(run_id, &handle, |txn| {
            let (si, ti) = txn.locate(step_id).ok_or(RunError::StepNotFound(step_id))?;
            let step = &txn.run.stages[si].steps[ti];
            let current = step.status;

            let held = matches!(current, Status::Started | Status::Running);
            if !held || status == Status::Started || !current.can_transition_to(status) {
                tracing::warn!(
                    run_id = %run_id,
                    "Rejected transition of step {}: {} -> {}",
                    step_id,
                    current,
                    status
                );
                return Err(RunError::InvalidTransition {
                    entity: format!("step {step_id}"),
                    from: current,
                    to: status,
                });
            }

            if status == Status::Running {
                txn.run.stages[si].steps[ti].status = Status::Running;
                txn.emit(
                    topics::step(run_id, step_id, "running"),
                    json!({ "step_id": step_id, "status": Status::Running }),
                );
            } else {
                let status = if step.cancel_requested && status != Status::Errored {
                    Status::Cancelled
                } else {
                    status
                };
                txn.complete_step(si, ti, status, result);
                tracing::info!(run_id = %run_id, "Step {} {}", step_id, status);
            }

            Ok(txn.run.stages[si].steps[ti].clone())
        })
    }

    /// Accept one chunk of output from the agent holding a step
    ///
    /// `sequence` is the agent's per-attempt counter and is used to drop
    /// duplicates. Accepted chunks are renumbered into the step's own
    /// sequence, which keeps increasing across attempts. Returns false for a
    /// duplicate.
    pub fn report_step_output(&self, step_id: Uuid, sequence: u64, line: String) -> Result<bool> {
        let (run_id, handle) = self.step_handle(step_id)?;

        self.apply(run_id, &handle, |txn| {
            let (si, ti) = txn.locate(step_id).ok_or(RunError::StepNotFound(step_id))?;
            let step = &mut txn.run.stages[si].steps[ti];

            if !matches!(step.status, Status::Started | Status::Running) {
                return Err(RunError::StepNotRunning {
                    step_id,
                    status: step.status,
                });
            }
            if sequence <= step.last_output_sequence {
                return Ok(false);
            }

            step.last_output_sequence = sequence;
            step.output_chunks += 1;
            let chunk = OutputChunk {
                step_id,
                step_sequence: step.output_chunks,
                line,
            };
            let payload = serde_json::to_value(&chunk).unwrap_or_default();
            txn.emit(topics::step_output(run_id, step_id), payload);
            Ok(true)
        })
    }

    /// Cancel a run, a stage or a step and everything below it
    ///
    /// Queued steps are cancelled at once and never dispatched. Steps held by
    /// an agent are asked to stop; if the agent has not reported back when
    /// the grace period ends, the step is forced to Errored.
    pub fn request_cancel(&self, entity: EntityRef) -> Result<()> {
        match entity {
            EntityRef::Run(run_id) => {
                let handle = self.run_handle(run_id)?;
                self.apply(run_id, &handle, |txn| {
                    let current = txn.run.status;
                    if current.is_terminal() {
                        return Err(RunError::InvalidTransition {
                            entity: format!("run {run_id}"),
                            from: current,
                            to: Status::Cancelled,
                        });
                    }

                    for si in 0..txn.run.stages.len() {
                        txn.cancel_stage(si);
                    }

                    txn.run.status = Status::Cancelled;
                    txn.run.started_at.get_or_insert(txn.now);
                    txn.run.completed_at = Some(txn.now);
                    txn.run.reason = Some("cancelled".to_string());
                    txn.emit(
                        topics::run(run_id, "cancelled"),
                        json!({ "status": Status::Cancelled, "reason": "cancelled" }),
                    );
                    tracing::info!(run_id = %run_id, "Run cancelled");
                    Ok(())
                })
            }
            EntityRef::Stage { run_id, stage } => {
                let handle = self.run_handle(run_id)?;
                self.apply(run_id, &handle, |txn| {
                    let si = txn.stage_index(&stage).ok_or(RunError::StageNotFound {
                        run_id,
                        stage: stage.clone(),
                    })?;
                    let current = txn.run.stages[si].status;
                    if current.is_terminal() {
                        return Err(RunError::InvalidTransition {
                            entity: format!("stage {stage}"),
                            from: current,
                            to: Status::Cancelled,
                        });
                    }
                    txn.cancel_stage(si);
                    tracing::info!(run_id = %run_id, "Stage {} cancelled", stage);
                    Ok(())
                })
            }
            EntityRef::Step(step_id) => {
                let (run_id, handle) = self.step_handle(step_id)?;
                self.apply(run_id, &handle, |txn| {
                    let (si, ti) = txn.locate(step_id).ok_or(RunError::StepNotFound(step_id))?;
                    let current = txn.run.stages[si].steps[ti].status;
                    if current.is_terminal() {
                        return Err(RunError::InvalidTransition {
                            entity: format!("step {step_id}"),
                            from: current,
                            to: Status::Cancelled,
                        });
                    }
                    txn.cancel_step(si, ti);
                    Ok(())
                })
            }
        }
    }

    /// Offer every ready step of every run to the agent registry
    ///
    /// Never waits: steps with no eligible agent stay Queued until the next
    /// call. Returns how many steps were dispatched.
    pub fn dispatch_ready_steps(&self) -> usize {
        let mut dispatched = 0;

        for (run_id, handle) in self.inner.runs.list_all() {
            let ready = match handle.lock() {
                Ok(run) => Transition::new(run.clone(), self.inner.honor_allow_failure)
                    .has_ready_steps(),
                Err(_) => false,
            };
            if !ready {
                continue;
            }

            let agents = self.inner.agents.clone();
            match self.apply(run_id, &handle, |txn| Ok(txn.dispatch(&agents))) {
                Ok(count) => dispatched += count,
                Err(e) => tracing::warn!(run_id = %run_id, "Dispatch skipped: {}", e),
            }
        }

        dispatched
    }

    /// Put a step taken back from a timed-out agent back in the queue
    ///
    /// Only acts while `agent_id` still holds the step, so a step is requeued
    /// at most once per timeout. A step that was being cancelled is
    /// cancelled instead. Returns whether anything changed.
    pub fn requeue_step(&self, step_id: Uuid, agent_id: &str) -> Result<bool> {
        let (run_id, handle) = self.step_handle(step_id)?;

        self.apply(run_id, &handle, |txn| {
            let (si, ti) = txn.locate(step_id).ok_or(RunError::StepNotFound(step_id))?;
            let step = &mut txn.run.stages[si].steps[ti];

            let held = matches!(step.status, Status::Started | Status::Running);
            if !held || step.agent_id.as_deref() != Some(agent_id) {
                return Ok(false);
            }

            if step.cancel_requested {
                step.status = Status::Cancelled;
                step.completed_at = Some(txn.now);
                txn.emit_step_completed(si, ti, None);
                return Ok(true);
            }

            step.status = Status::Queued;
            step.agent_id = None;
            step.started_at = None;
            step.last_output_sequence = 0;
            step.attempt += 1;
            let attempt = step.attempt;
            txn.effects.ready = true;
            txn.emit(
                topics::step(run_id, step_id, "requeued"),
                json!({
                    "step_id": step_id,
                    "agent_id": agent_id,
                    "attempt": attempt,
                    "reason": format!("agent {agent_id} timed out"),
                }),
            );
            tracing::warn!(run_id = %run_id, "Step {} requeued after agent {} timed out", step_id, agent_id);
            Ok(true)
        })
    }

    /// Force a step to Errored when its cancellation grace period ran out
    fn expire_cancel(&self, step_id: Uuid, attempt: u32) -> Result<bool> {
        let (run_id, handle) = self.step_handle(step_id)?;

        self.apply(run_id, &handle, |txn| {
            let (si, ti) = txn.locate(step_id).ok_or(RunError::StepNotFound(step_id))?;
            let step = &txn.run.stages[si].steps[ti];
            if step.status.is_terminal() || !step.cancel_requested || step.attempt != attempt {
                return Ok(false);
            }

            tracing::warn!(run_id = %run_id, "Step {} forced to errored: {}", step_id, GRACE_EXPIRED);
            txn.complete_step(si, ti, Status::Errored, Some(StepResult::message(GRACE_EXPIRED)));
            Ok(true)
        })
    }

    /// Remove runs that completed more than `retention` ago from the live
    /// working set. Returns their ids.
    pub fn archive_completed(&self, now: DateTime<Utc>, retention: Duration) -> Vec<Uuid> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut archived = Vec::new();

        for (run_id, handle) in self.inner.runs.list_all() {
            let expired = match handle.lock() {
                Ok(run) => run
                    .completed_at
                    .is_some_and(|done| run.status.is_terminal() && now - done > retention),
                Err(_) => false,
            };
            if expired && self.inner.runs.delete(run_id) {
                self.inner.bus.forget_run(run_id);
                tracing::debug!(run_id = %run_id, "Run archived");
                archived.push(run_id);
            }
        }

        archived
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a run by ID
    pub fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let handle = self.run_handle(run_id)?;
        let run = handle
            .lock()
            .map_err(|_| RunError::RunUnavailable(run_id))?;
        Ok(run.clone())
    }

    /// Get a step by ID
    pub fn get_step(&self, step_id: Uuid) -> Result<Step> {
        let (run_id, handle) = self.step_handle(step_id)?;
        let run = handle
            .lock()
            .map_err(|_| RunError::RunUnavailable(run_id))?;
        run.step(step_id)
            .cloned()
            .ok_or(RunError::StepNotFound(step_id))
    }

    /// The run a step belongs to
    pub fn run_of_step(&self, step_id: Uuid) -> Result<Uuid> {
        self.step_handle(step_id).map(|(run_id, _)| run_id)
    }

    /// List all live runs, newest first
    pub fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .inner
            .runs
            .list_all()
            .into_iter()
            .filter_map(|(run_id, handle)| match handle.lock() {
                Ok(run) => Some(run.clone()),
                Err(_) => {
                    tracing::warn!(run_id = %run_id, "Skipping unavailable run");
                    None
                }
            })
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }
}

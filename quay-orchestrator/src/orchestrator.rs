//! Orchestrator
//!
//! Wires the services around one shared event bus and runs the background
//! loops that keep them moving: dispatch, agent liveness, run retention,
//! the log pump and the webhook trigger consumer.

use chrono::Utc;
use quay_core::domain::run::Run;
use quay_core::dto::run::CreateRun;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::service::agent::{AgentRegistry, Result as AgentResult, SweepReport};
use crate::service::event_bus::EventBus;
use crate::service::log_stream::{LogStreamController, LogTail};
use crate::service::pipeline::PipelineCatalog;
use crate::service::run::{Result as RunResult, RunError, RunStateMachine};
use crate::service::trigger;

pub struct Orchestrator {
    pub config: Config,
    pub bus: EventBus,
    pub agents: AgentRegistry,
    pub runs: RunStateMachine,
    pub pipelines: Arc<PipelineCatalog>,
    pub logs: LogStreamController,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let bus = EventBus::from_config(&config);
        let agents = AgentRegistry::from_config(bus.clone(), &config);
        let runs = RunStateMachine::new(
            bus.clone(),
            agents.clone(),
            config.honor_allow_failure,
            config.cancel_grace_period,
        );
        let pipelines = Arc::new(PipelineCatalog::new(bus.clone()));
        let logs = LogStreamController::new(
            config.log_retained_chunks,
            config.subscriber_queue_capacity,
        );

        Self {
            config,
            bus,
            agents,
            runs,
            pipelines,
            logs,
        }
    }

    /// Start every background loop. They all stop once `shutdown` flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone_parts().dispatch_loop(shutdown.clone())),
            tokio::spawn(self.clone_parts().liveness_loop(shutdown.clone())),
            tokio::spawn(self.clone_parts().retention_loop(shutdown.clone())),
            tokio::spawn(
                self.logs
                    .clone()
                    .run_pump(self.bus.clone(), shutdown.clone()),
            ),
            tokio::spawn(trigger::run_consumer(
                self.bus.clone(),
                Arc::clone(&self.pipelines),
                self.runs.clone(),
                shutdown,
            )),
        ]
    }

    fn clone_parts(&self) -> Loops {
        Loops {
            config: self.config.clone(),
            agents: self.agents.clone(),
            runs: self.runs.clone(),
            logs: self.logs.clone(),
        }
    }

    /// Create a run from a catalog pipeline
    pub fn create_run(&self, req: CreateRun) -> RunResult<Run> {
        let pipeline = self
            .pipelines
            .get_pipeline(&req.pipeline)
            .map_err(|_| RunError::PipelineNotFound(req.pipeline.clone()))?;
        let run = self.runs.create_run(pipeline, req.trigger)?;
        Ok(run)
    }

    /// Remove an agent and put the step it held back in the queue
    pub fn deregister_agent(&self, agent_id: &str) -> AgentResult<()> {
        if let Some(step_id) = self.agents.deregister(agent_id)? {
            match self.runs.requeue_step(step_id, agent_id) {
                Ok(_) => {}
                Err(e) => tracing::warn!("Could not requeue step {}: {}", step_id, e),
            }
        }
        Ok(())
    }

    /// Open a log tail on a step the orchestrator knows about
    pub fn tail_step(&self, step_id: Uuid, from: u64) -> RunResult<LogTail> {
        let run_id = self.runs.run_of_step(step_id)?;
        Ok(self.logs.tail(run_id, step_id, from))
    }
}

/// Handles the background loops own
struct Loops {
    config: Config,
    agents: AgentRegistry,
    runs: RunStateMachine,
    logs: LogStreamController,
}

impl Loops {
    /// Dispatch whenever an agent frees up or steps become ready, with a
    /// periodic pass as a fallback
    async fn dispatch_loop(self, mut shutdown: watch::Receiver<bool>) {
        let available = self.agents.availability();
        let ready = self.runs.readiness();
        let mut fallback = tokio::time::interval(self.config.heartbeat_interval);

        tracing::info!("Dispatch loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = available.notified() => {}
                _ = ready.notified() => {}
                _ = fallback.tick() => {}
            }

            let dispatched = self.runs.dispatch_ready_steps();
            if dispatched > 0 {
                tracing::debug!("Dispatched {} step(s)", dispatched);
            }
        }

        tracing::info!("Dispatch loop stopped");
    }

    /// Sweep agents every heartbeat interval and requeue what timed-out
    /// agents were holding
    async fn liveness_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);

        tracing::info!("Liveness loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.agents.sweep(Utc::now());
                    requeue_timed_out(&self.runs, &report);
                }
            }
        }

        tracing::info!("Liveness loop stopped");
    }

    async fn retention_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    for run_id in self.runs.archive_completed(Utc::now(), self.config.run_retention) {
                        self.logs.forget_run(run_id);
                    }
                }
            }
        }
    }
}

/// Requeue every step taken back by a liveness sweep
pub fn requeue_timed_out(runs: &RunStateMachine, report: &SweepReport) -> usize {
    let mut requeued = 0;
    for timeout in &report.timeouts {
        let Some(step_id) = timeout.step_id else {
            continue;
        };
        match runs.requeue_step(step_id, &timeout.agent_id) {
            Ok(true) => requeued += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("Could not requeue step {}: {}", step_id, e),
        }
    }
    requeued
}

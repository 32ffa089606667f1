//! Run and step endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use quay_core::domain::run::{Run, Status, Step, StepResult, TriggerMetadata};
use quay_core::dto::run::{CreateRun, OutputAck, RunSummary, StepOutput, StepTransition};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Runs
    // =============================================================================

    /// Create a run of a catalog pipeline
    pub async fn create_run(&self, pipeline: &str, trigger: TriggerMetadata) -> Result<Run> {
        let response = self
            .client
            .post(self.url("/run/create"))
            .json(&CreateRun {
                pipeline: pipeline.to_string(),
                trigger,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List live runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let response = self.client.get(self.url("/run/list")).send().await?;

        self.handle_response(response).await
    }

    /// Get a run snapshot
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let response = self
            .client
            .get(self.url(&format!("/run/{}", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a whole run
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/run/{}/cancel", run_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Request cancellation of one stage of a run
    pub async fn cancel_stage(&self, run_id: Uuid, stage: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/run/{}/stage/{}/cancel", run_id, stage)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Steps
    // =============================================================================

    pub async fn get_step(&self, step_id: Uuid) -> Result<Step> {
        let response = self
            .client
            .get(self.url(&format!("/step/{}", step_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a single step
    pub async fn cancel_step(&self, step_id: Uuid) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/step/{}/cancel", step_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Report that a step started running or reached a terminal status
    pub async fn report_step_transition(
        &self,
        step_id: Uuid,
        status: Status,
        result: Option<StepResult>,
    ) -> Result<Step> {
        let response = self
            .client
            .post(self.url(&format!("/step/{}/transition", step_id)))
            .json(&StepTransition { status, result })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Report one chunk of step output
    ///
    /// Returns `false` when the orchestrator already had this sequence, which
    /// makes retries after a timeout safe.
    pub async fn report_step_output(
        &self,
        step_id: Uuid,
        sequence: u64,
        line: impl Into<String>,
    ) -> Result<bool> {
        let response = self
            .client
            .post(self.url(&format!("/step/{}/output", step_id)))
            .json(&StepOutput {
                sequence,
                line: line.into(),
            })
            .send()
            .await?;

        let ack: OutputAck = self.handle_response(response).await?;
        Ok(ack.accepted)
    }
}

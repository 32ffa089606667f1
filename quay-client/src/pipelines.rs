//! Pipeline catalog endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use quay_core::domain::pipeline::Pipeline;
use quay_core::dto::pipeline::{CreatePipeline, PipelineSummary};

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Catalog
    // =============================================================================

    /// Create a new pipeline at version 1
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<Pipeline> {
        let response = self
            .client
            .post(self.url("/pipeline/create"))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Replace a pipeline's definition; the orchestrator bumps its version
    pub async fn update_pipeline(&self, name: &str, req: CreatePipeline) -> Result<Pipeline> {
        let response = self
            .client
            .put(self.url(&format!("/pipeline/{}", name)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List all pipelines
    pub async fn list_pipelines(&self) -> Result<Vec<PipelineSummary>> {
        let response = self.client.get(self.url("/pipeline/list")).send().await?;

        self.handle_response(response).await
    }

    /// Get a pipeline by name
    pub async fn get_pipeline(&self, name: &str) -> Result<Pipeline> {
        let response = self
            .client
            .get(self.url(&format!("/pipeline/{}", name)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Delete a pipeline
    pub async fn delete_pipeline(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/pipeline/{}", name)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

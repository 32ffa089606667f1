//! Agent endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use quay_core::domain::agent::Agent;
use quay_core::dto::agent::{AgentSummary, Heartbeat, HeartbeatAck, RegisterAgent};

impl OrchestratorClient {
    // =============================================================================
    // Agent Registration & Lifecycle
    // =============================================================================

    /// Register an agent with the orchestrator
    ///
    /// # Example
    /// ```no_run
    /// # use quay_client::OrchestratorClient;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let agent = client
    ///     .register_agent("agent-001", vec!["linux".to_string(), "docker".to_string()])
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register_agent(&self, agent_id: &str, capabilities: Vec<String>) -> Result<Agent> {
        let response = self
            .client
            .post(self.url("/agent/register"))
            .json(&RegisterAgent {
                agent_id: agent_id.to_string(),
                capabilities,
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Send a heartbeat
    ///
    /// Must be called at least once per heartbeat interval. The reply names
    /// the step the agent holds and any step it should stop.
    pub async fn send_heartbeat(&self, agent_id: &str, heartbeat: Heartbeat) -> Result<HeartbeatAck> {
        let response = self
            .client
            .post(self.url(&format!("/agent/{}/heartbeat", agent_id)))
            .json(&heartbeat)
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        let response = self.client.get(self.url("/agent/list")).send().await?;

        self.handle_response(response).await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Agent> {
        let response = self
            .client
            .get(self.url(&format!("/agent/{}", agent_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Deregister an agent; a step it held is requeued
    pub async fn deregister_agent(&self, agent_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/agent/{}", agent_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}

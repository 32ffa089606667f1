//! Agent API Handlers
//!
//! Registration, heartbeats and inspection of the agent fleet.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use quay_core::domain::agent::Agent;
use quay_core::dto::agent::{AgentSummary, Heartbeat, HeartbeatAck, RegisterAgent};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /agent/register
/// Register a new agent
pub async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<RegisterAgent>,
) -> ApiResult<(StatusCode, Json<Agent>)> {
    tracing::info!(
        "Registering agent: {} with capabilities: {:?}",
        req.agent_id,
        req.capabilities
    );

    let agent = state.orchestrator.agents.register_agent(req)?;

    Ok((StatusCode::CREATED, Json(agent)))
}

/// POST /agent/{id}/heartbeat
/// Record a heartbeat; the reply carries pending work and cancellations
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<Heartbeat>,
) -> ApiResult<Json<HeartbeatAck>> {
    tracing::debug!("Heartbeat from agent: {}", id);

    Ok(Json(state.orchestrator.agents.heartbeat(&id, req)?))
}

/// GET /agent/list
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    tracing::debug!("Listing agents");

    let agents = state.orchestrator.agents.list_agents();

    Json(agents.into_iter().map(AgentSummary::from).collect())
}

/// GET /agent/{id}
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Agent>> {
    Ok(Json(state.orchestrator.agents.get_agent(&id)?))
}

/// DELETE /agent/{id}
/// Deregister an agent; a step it held goes back to the queue
pub async fn deregister_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deregistering agent: {}", id);

    state.orchestrator.deregister_agent(&id)?;

    Ok(StatusCode::NO_CONTENT)
}

//! Health Check API Handler
//!
//! Liveness endpoint for monitoring, with a small snapshot of the
//! orchestrator's working set.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub agents: usize,
    pub runs: usize,
    pub subscribers: usize,
}

/// GET /health
/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<Health> {
    let orchestrator = &state.orchestrator;
    Json(Health {
        status: "ok",
        agents: orchestrator.agents.list_agents().len(),
        runs: orchestrator.runs.list_runs().len(),
        subscribers: orchestrator.bus.subscriber_count(),
    })
}

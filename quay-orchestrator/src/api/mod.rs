//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod agent;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod run;
pub mod stream;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::Orchestrator;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Flips to `true` on shutdown; open event streams end with it
    pub shutdown: watch::Receiver<bool>,
}

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: Arc<Orchestrator>, shutdown: watch::Receiver<bool>) -> Router {
    let state = AppState {
        orchestrator,
        shutdown,
    };

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline catalog
        .route("/pipeline/create", post(pipeline::create_pipeline))
        .route("/pipeline/list", get(pipeline::list_pipelines))
        .route(
            "/pipeline/{name}",
            get(pipeline::get_pipeline)
                .put(pipeline::update_pipeline)
                .delete(pipeline::delete_pipeline),
        )
        // Runs
        .route("/run/create", post(run::create_run))
        .route("/run/list", get(run::list_runs))
        .route("/run/{id}", get(run::get_run))
        .route("/run/{id}/cancel", post(run::cancel_run))
        .route("/run/{id}/stage/{name}/cancel", post(run::cancel_stage))
        // Steps, reported by agents
        .route("/step/{id}", get(run::get_step))
        .route("/step/{id}/cancel", post(run::cancel_step))
        .route("/step/{id}/transition", post(run::report_transition))
        .route("/step/{id}/output", post(run::report_output))
        .route("/step/{id}/logs", get(stream::tail_step_logs))
        // Agents
        .route("/agent/register", post(agent::register_agent))
        .route("/agent/list", get(agent::list_agents))
        .route(
            "/agent/{id}",
            get(agent::get_agent).delete(agent::deregister_agent),
        )
        .route("/agent/{id}/heartbeat", post(agent::heartbeat))
        // Event streams
        .route("/events", get(stream::subscribe_events))
        .route("/webhook/github", post(stream::receive_github_webhook))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

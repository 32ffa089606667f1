//! Pipeline API Handlers
//!
//! HTTP endpoints for the pipeline catalog.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use quay_core::domain::pipeline::Pipeline;
use quay_core::dto::pipeline::{CreatePipeline, PipelineSummary};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /pipeline/create
/// Create a new pipeline
pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    tracing::info!("Creating pipeline: {}", req.name);

    let pipeline = state.orchestrator.pipelines.create_pipeline(req)?;

    Ok((StatusCode::CREATED, Json((*pipeline).clone())))
}

/// GET /pipeline/list
/// List all pipelines
pub async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineSummary>> {
    tracing::debug!("Listing all pipelines");

    let pipelines = state.orchestrator.pipelines.list_pipelines();

    Json(pipelines.iter().map(|p| PipelineSummary::from(&**p)).collect())
}

/// GET /pipeline/{name}
/// Get pipeline by name
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Pipeline>> {
    tracing::debug!("Getting pipeline: {}", name);

    let pipeline = state.orchestrator.pipelines.get_pipeline(&name)?;

    Ok(Json((*pipeline).clone()))
}

/// PUT /pipeline/{name}
/// Replace a pipeline's definition
pub async fn update_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<Json<Pipeline>> {
    tracing::info!("Updating pipeline: {}", name);

    let pipeline = state.orchestrator.pipelines.update_pipeline(&name, req)?;

    Ok(Json((*pipeline).clone()))
}

/// DELETE /pipeline/{name}
/// Delete a pipeline
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", name);

    state.orchestrator.pipelines.delete_pipeline(&name)?;

    Ok(StatusCode::NO_CONTENT)
}

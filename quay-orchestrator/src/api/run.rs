//! Run API Handlers
//!
//! HTTP endpoints for runs, cancellation and the step reports agents send.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use quay_core::domain::run::{Run, Step};
use quay_core::dto::run::{CreateRun, OutputAck, RunSummary, StepOutput, StepTransition};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::run::EntityRef;

/// POST /run/create
/// Create a run from a catalog pipeline
pub async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRun>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    tracing::info!(
        "Creating run of pipeline {} at commit {}",
        req.pipeline,
        req.trigger.commit
    );

    let run = state.orchestrator.create_run(req)?;

    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /run/list
/// List live runs, newest first
pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSummary>> {
    tracing::debug!("Listing runs");

    let runs = state.orchestrator.runs.list_runs();

    Json(runs.iter().map(RunSummary::from).collect())
}

/// GET /run/{id}
/// Get a run snapshot
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    Ok(Json(state.orchestrator.runs.get_run(id)?))
}

/// POST /run/{id}/cancel
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling run: {}", id);

    state.orchestrator.runs.request_cancel(EntityRef::Run(id))?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /run/{id}/stage/{name}/cancel
pub async fn cancel_stage(
    State(state): State<AppState>,
    Path((run_id, stage)): Path<(Uuid, String)>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling stage {} of run {}", stage, run_id);

    state
        .orchestrator
        .runs
        .request_cancel(EntityRef::Stage { run_id, stage })?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /step/{id}
pub async fn get_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Step>> {
    Ok(Json(state.orchestrator.runs.get_step(id)?))
}

/// POST /step/{id}/cancel
pub async fn cancel_step(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling step: {}", id);

    state.orchestrator.runs.request_cancel(EntityRef::Step(id))?;

    Ok(StatusCode::ACCEPTED)
}

/// POST /step/{id}/transition
/// Agent reports that a step started running or finished
pub async fn report_transition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StepTransition>,
) -> ApiResult<Json<Step>> {
    tracing::info!("Step {} reported {}", id, req.status);

    let step = state
        .orchestrator
        .runs
        .report_step_transition(id, req.status, req.result)?;

    Ok(Json(step))
}

/// POST /step/{id}/output
/// Agent reports one chunk of step output
pub async fn report_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StepOutput>,
) -> ApiResult<Json<OutputAck>> {
    let accepted = state
        .orchestrator
        .runs
        .report_step_output(id, req.sequence, req.line)?;

    if !accepted {
        tracing::debug!("Duplicate output {} for step {}", req.sequence, id);
    }

    Ok(Json(OutputAck { accepted }))
}

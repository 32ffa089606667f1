//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::agent::AgentError;
use crate::service::event_bus::EventBusError;
use crate::service::log_stream::LogStreamError;
use crate::service::pipeline::PipelineError;
use crate::service::run::RunError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    ServiceUnavailable(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        let message = err.to_string();
        match err {
            RunError::RunNotFound(_)
            | RunError::StageNotFound { .. }
            | RunError::StepNotFound(_)
            | RunError::PipelineNotFound(_) => ApiError::NotFound(message),
            RunError::InvalidPipeline(_) => ApiError::BadRequest(message),
            RunError::InvalidTransition { .. } | RunError::StepNotRunning { .. } => {
                ApiError::Conflict(message)
            }
            RunError::RunUnavailable(_) => ApiError::ServiceUnavailable(message),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::AgentNotFound(_) => ApiError::NotFound(message),
            AgentError::DuplicateAgent(_) => ApiError::Conflict(message),
            AgentError::Validation(_) => ApiError::BadRequest(message),
            AgentError::NoEligibleAgent(_) => ApiError::ServiceUnavailable(message),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::NotFound(_) => ApiError::NotFound(message),
            PipelineError::AlreadyExists(_) => ApiError::Conflict(message),
            PipelineError::Validation(_) => ApiError::BadRequest(message),
        }
    }
}

impl From<EventBusError> for ApiError {
    fn from(err: EventBusError) -> Self {
        let message = err.to_string();
        match err {
            EventBusError::InvalidPattern(_) => ApiError::BadRequest(message),
            EventBusError::UnknownRun(_) => ApiError::NotFound(message),
            EventBusError::RunUnavailable(_) => ApiError::ServiceUnavailable(message),
        }
    }
}

impl From<LogStreamError> for ApiError {
    fn from(err: LogStreamError) -> Self {
        let message = err.to_string();
        match err {
            LogStreamError::Lagged { .. } => ApiError::ServiceUnavailable(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use quay_core::domain::run::Status;
    use uuid::Uuid;

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            status_of(RunError::RunNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(RunError::InvalidTransition {
                entity: "step".to_string(),
                from: Status::Succeeded,
                to: Status::Failed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(RunError::RunUnavailable(Uuid::new_v4())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(AgentError::DuplicateAgent("a1".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(PipelineError::Validation("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(EventBusError::UnknownRun(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
    }
}

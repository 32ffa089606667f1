//! Run DTOs for inter-service communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{Run, Status, StepResult, TriggerMetadata};

/// Request to create a run from a catalog pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRun {
    pub pipeline: String,
    pub trigger: TriggerMetadata,
}

/// Step transition reported by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransition {
    pub status: Status,
    #[serde(default)]
    pub result: Option<StepResult>,
}

/// One chunk of step output reported by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Per-step sequence, strictly increasing for each step
    pub sequence: u64,
    pub line: String,
}

/// Whether a reported output chunk was new or a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAck {
    pub accepted: bool,
}

/// Summary information about a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline_name: String,
    pub pipeline_version: u32,
    pub commit: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        RunSummary {
            id: run.id,
            pipeline_name: run.pipeline_name.clone(),
            pipeline_version: run.pipeline_version,
            commit: run.trigger.commit.clone(),
            status: run.status,
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

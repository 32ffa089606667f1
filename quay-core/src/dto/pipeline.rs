//! Pipeline DTOs for inter-service communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::{Pipeline, StageDefinition};

/// Request to create a pipeline, or to replace its definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
}

/// Summary information about a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub stage_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&Pipeline> for PipelineSummary {
    fn from(pipeline: &Pipeline) -> Self {
        PipelineSummary {
            id: pipeline.id,
            name: pipeline.name.clone(),
            version: pipeline.version,
            stage_count: pipeline.stages.len(),
            updated_at: pipeline.updated_at,
        }
    }
}

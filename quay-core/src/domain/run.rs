//! Run domain types
//!
//! A run is one execution of a pipeline. Its stages and steps are all
//! materialized when the run is created and move forward through the same
//! lifecycle: Queued, Started, Running, then one terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status shared by runs, stages and steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Started,
    Running,
    /// Completed(success)
    Succeeded,
    /// Completed(failure)
    Failed,
    Cancelled,
    Errored,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Errored
        )
    }

    /// Position in the forward lifecycle. Every terminal status shares the
    /// last position.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Started => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    /// How strongly a terminal status dominates when aggregating children.
    fn severity(&self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Cancelled => 2,
            Self::Errored => 3,
            _ => 0,
        }
    }

    /// The worse of two terminal statuses
    pub fn worst(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Legal per-step transitions reported through the state machine.
    ///
    /// Requeueing after an agent timeout is handled separately and is not a
    /// transition in this table.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Started | Self::Cancelled),
            Self::Started => matches!(
                next,
                Self::Running | Self::Succeeded | Self::Failed | Self::Cancelled | Self::Errored
            ),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub commit: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Final report attached to a terminal step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl StepResult {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            message: Some(message.into()),
        }
    }
}

/// Run execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    pub pipeline_version: u32,
    pub trigger: TriggerMetadata,
    pub status: Status,
    /// Why the run ended the way it did, when it did not simply succeed
    pub reason: Option<String>,
    /// Last event sequence number assigned to this run
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stages in dependency order
    pub stages: Vec<Stage>,
}

/// Stage instance inside a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub depends_on: Vec<String>,
    pub allow_failure: bool,
    /// Never ran because an upstream stage did not succeed
    pub skipped: bool,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<Step>,
}

/// Step instance inside a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub name: String,
    pub stage: String,
    pub requires: Vec<String>,
    pub payload: serde_json::Value,
    pub status: Status,
    /// Agent currently holding the step, by id in the agent registry
    pub agent_id: Option<String>,
    /// Incremented each time the step is requeued after an agent timeout
    pub attempt: u32,
    /// Cancellation was sent to the agent holding the step
    #[serde(default)]
    pub cancel_requested: bool,
    /// Number of output chunks accepted so far
    pub output_chunks: u64,
    /// Highest per-step output sequence accepted so far
    pub last_output_sequence: u64,
    pub result: Option<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&Step> {
        self.stages
            .iter()
            .flat_map(|s| s.steps.iter())
            .find(|s| s.id == step_id)
    }

    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }
}

impl Stage {
    /// Status this stage contributes to its run's aggregate.
    ///
    /// Returns `None` for skipped stages, which do not take part in
    /// aggregation.
    pub fn contribution(&self, honor_allow_failure: bool) -> Option<Status> {
        if self.skipped {
            return None;
        }
        match self.status {
            Status::Failed if self.allow_failure && honor_allow_failure => Some(Status::Succeeded),
            status => Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Started.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Errored.is_terminal());
    }

    #[test]
    fn test_worst_of() {
        assert_eq!(Status::Succeeded.worst(Status::Failed), Status::Failed);
        assert_eq!(Status::Failed.worst(Status::Succeeded), Status::Failed);
        assert_eq!(Status::Failed.worst(Status::Cancelled), Status::Cancelled);
        assert_eq!(Status::Cancelled.worst(Status::Errored), Status::Errored);
        assert_eq!(Status::Succeeded.worst(Status::Succeeded), Status::Succeeded);
    }

    #[test]
    fn test_step_transitions_only_move_forward() {
        assert!(Status::Queued.can_transition_to(Status::Started));
        assert!(Status::Queued.can_transition_to(Status::Cancelled));
        assert!(!Status::Queued.can_transition_to(Status::Running));
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));

        assert!(Status::Started.can_transition_to(Status::Running));
        assert!(Status::Started.can_transition_to(Status::Failed));
        assert!(!Status::Started.can_transition_to(Status::Queued));
        assert!(!Status::Running.can_transition_to(Status::Started));
        assert!(Status::Running.can_transition_to(Status::Errored));

        for terminal in [
            Status::Succeeded,
            Status::Failed,
            Status::Cancelled,
            Status::Errored,
        ] {
            assert!(!terminal.can_transition_to(Status::Succeeded));
            assert!(!terminal.can_transition_to(Status::Cancelled));
        }
    }

    #[test]
    fn test_allow_failure_contribution() {
        let mut stage = Stage {
            name: "lint".to_string(),
            depends_on: vec![],
            allow_failure: true,
            skipped: false,
            status: Status::Failed,
            started_at: None,
            completed_at: None,
            steps: vec![],
        };

        assert_eq!(stage.contribution(true), Some(Status::Succeeded));
        assert_eq!(stage.contribution(false), Some(Status::Failed));

        stage.status = Status::Errored;
        assert_eq!(stage.contribution(true), Some(Status::Errored));

        stage.skipped = true;
        assert_eq!(stage.contribution(true), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Status::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(Status::Errored.to_string(), "errored");
    }
}

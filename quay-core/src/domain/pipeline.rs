//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline definition
///
/// A named, versioned set of stages and their dependency DAG. A run takes an
/// immutable snapshot of the pipeline at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// A stage declared in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Failure of this stage does not fail the run
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// A step declared in a stage
///
/// The payload is opaque to the orchestrator; only the agent interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Capability labels an agent must advertise to run this step
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Structural problems in a stage dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineGraphError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("invalid stage name '{0}': use letters, digits, '-' or '_'")]
    InvalidStageName(String),

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("unknown dependency '{dependency}' in stage '{stage}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle detected involving stages: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

impl StageDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            allow_failure: false,
            steps: Vec::new(),
        }
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires.push(capability.into());
        self
    }
}

/// Order stages so that every stage comes after all of its dependencies.
///
/// Returns indices into `stages`. Ties keep declaration order, so a pipeline
/// declared in dependency order comes back unchanged.
pub fn topological_order(stages: &[StageDefinition]) -> Result<Vec<usize>, PipelineGraphError> {
    if stages.is_empty() {
        return Err(PipelineGraphError::Empty);
    }

    let mut index_map: HashMap<&str, usize> = HashMap::with_capacity(stages.len());
    for (i, stage) in stages.iter().enumerate() {
        if !crate::topic::is_valid_segment(&stage.name) {
            return Err(PipelineGraphError::InvalidStageName(stage.name.clone()));
        }
        if index_map.insert(stage.name.as_str(), i).is_some() {
            return Err(PipelineGraphError::DuplicateStage(stage.name.clone()));
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
    let mut in_degree: Vec<usize> = vec![0; stages.len()];

    for (to, stage) in stages.iter().enumerate() {
        for dep in &stage.depends_on {
            let from = *index_map.get(dep.as_str()).ok_or_else(|| {
                PipelineGraphError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                }
            })?;
            dependents[from].push(to);
            in_degree[to] += 1;
        }
    }

    // Kahn's algorithm, always taking the lowest ready index
    let mut ready: std::collections::BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != stages.len() {
        let cyclic = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| stages[i].name.clone())
            .collect();
        return Err(PipelineGraphError::Cycle(cyclic));
    }

    Ok(order)
}

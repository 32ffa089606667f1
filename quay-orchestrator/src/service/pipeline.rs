//! Pipeline Service
//!
//! Business logic for the pipeline catalog.

use quay_core::domain::event::EventDraft;
use quay_core::domain::pipeline::{Pipeline, topological_order};
use quay_core::dto::pipeline::CreatePipeline;
use quay_core::topic::topics;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::pipeline_repository::PipelineStore;
use crate::service::event_bus::EventBus;

/// Service error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline '{0}' not found")]
    NotFound(String),

    #[error("pipeline '{0}' already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Named, versioned pipeline definitions
pub struct PipelineCatalog {
    store: PipelineStore,
    bus: EventBus,
}

impl PipelineCatalog {
    pub fn new(bus: EventBus) -> Self {
        Self {
            store: PipelineStore::new(),
            bus,
        }
    }

    fn emit(&self, kind: &str, pipeline: &Pipeline) {
        let payload = json!({
            "id": pipeline.id,
            "name": pipeline.name,
            "version": pipeline.version,
        });
        if let Err(e) = self
            .bus
            .publish(EventDraft::system(topics::pipeline(kind), payload))
        {
            tracing::warn!("Failed to publish pipeline event: {}", e);
        }
    }

    /// Create a new pipeline at version 1
    pub fn create_pipeline(&self, req: CreatePipeline) -> Result<Arc<Pipeline>> {
        // Validate request
        validate_pipeline_request(&req)?;

        let now = chrono::Utc::now();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: req.name.clone(),
            version: 1,
            description: req.description,
            stages: req.stages,
            created_at: now,
            updated_at: now,
        };

        if !self.store.create(pipeline) {
            return Err(PipelineError::AlreadyExists(req.name));
        }
        let pipeline = self
            .store
            .find_by_name(&req.name)
            .ok_or_else(|| PipelineError::NotFound(req.name.clone()))?;

        tracing::info!("Pipeline created: {} ({})", pipeline.name, pipeline.id);
        self.emit("created", &pipeline);

        Ok(pipeline)
    }

    /// Replace a pipeline's definition, bumping its version
    ///
    /// Runs created from an earlier version keep the snapshot they hold.
    pub fn update_pipeline(&self, name: &str, req: CreatePipeline) -> Result<Arc<Pipeline>> {
        // Validate request
        validate_pipeline_request(&req)?;

        if req.name != name {
            return Err(PipelineError::Validation(format!(
                "Pipeline name '{}' does not match '{}'",
                req.name, name
            )));
        }

        let updated = self
            .store
            .update(name, |current| Pipeline {
                id: current.id,
                name: current.name.clone(),
                version: current.version + 1,
                description: req.description,
                stages: req.stages,
                created_at: current.created_at,
                updated_at: chrono::Utc::now(),
            })
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;

        tracing::info!(
            "Pipeline updated: {} (version {})",
            updated.name,
            updated.version
        );
        self.emit("updated", &updated);

        Ok(updated)
    }

    /// Get a pipeline by name
    pub fn get_pipeline(&self, name: &str) -> Result<Arc<Pipeline>> {
        self.store
            .find_by_name(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))
    }

    /// List all pipelines
    pub fn list_pipelines(&self) -> Vec<Arc<Pipeline>> {
        self.store.list_all()
    }

    /// Delete a pipeline
    pub fn delete_pipeline(&self, name: &str) -> Result<()> {
        let deleted = self
            .store
            .delete(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;

        tracing::info!("Pipeline deleted: {}", name);
        self.emit("deleted", &deleted);

        Ok(())
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(PipelineError::Validation(
            "Pipeline name cannot be empty".to_string(),
        ));
    }

    if req.name.len() > 255 {
        return Err(PipelineError::Validation(
            "Pipeline name is too long (max 255 characters)".to_string(),
        ));
    }

    // Stage graph must be closed and acyclic
    topological_order(&req.stages).map_err(|e| PipelineError::Validation(e.to_string()))?;

    for stage in &req.stages {
        if stage.steps.iter().any(|s| s.name.trim().is_empty()) {
            return Err(PipelineError::Validation(format!(
                "Stage '{}' has a step without a name",
                stage.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use quay_core::domain::pipeline::{StageDefinition, StepDefinition};
    use quay_core::topic::TopicPattern;

    fn catalog() -> (PipelineCatalog, EventBus) {
        let bus = EventBus::new(16, 16, OverflowPolicy::DropOldest);
        (PipelineCatalog::new(bus.clone()), bus)
    }

    fn request(name: &str) -> CreatePipeline {
        CreatePipeline {
            name: name.to_string(),
            description: None,
            stages: vec![
                StageDefinition::new("build").with_step(StepDefinition::new("compile")),
                StageDefinition::new("test")
                    .depends_on("build")
                    .with_step(StepDefinition::new("unit")),
            ],
        }
    }

    #[test]
    fn test_validate_empty_name() {
        let result = validate_pipeline_request(&request(""));
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_validate_cyclic_stages() {
        let mut req = request("cyclic");
        req.stages[0] = req.stages[0].clone().depends_on("test");

        let result = validate_pipeline_request(&req);
        assert!(matches!(result, Err(PipelineError::Validation(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_validate_no_stages() {
        let mut req = request("empty");
        req.stages.clear();
        assert!(validate_pipeline_request(&req).is_err());
    }

    #[test]
    fn test_create_and_get() {
        let (catalog, bus) = catalog();
        let mut events = bus
            .subscribe(TopicPattern::new("pipeline.*").unwrap(), None)
            .unwrap();

        let created = catalog.create_pipeline(request("ci")).unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(catalog.get_pipeline("ci").unwrap().id, created.id);

        match events.try_recv().unwrap() {
            Some(crate::service::event_bus::Delivery::Event(event)) => {
                assert_eq!(event.topic.as_str(), "pipeline.created")
            }
            other => panic!("expected pipeline.created, got {:?}", other),
        }

        assert_eq!(
            catalog.create_pipeline(request("ci")).unwrap_err(),
            PipelineError::AlreadyExists("ci".to_string())
        );
    }

    #[test]
    fn test_update_bumps_version_and_keeps_snapshots() {
        let (catalog, _bus) = catalog();
        let v1 = catalog.create_pipeline(request("ci")).unwrap();

        let mut req = request("ci");
        req.stages.push(StageDefinition::new("deploy").depends_on("test"));
        let v2 = catalog.update_pipeline("ci", req).unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.id, v1.id);
        assert_eq!(v1.stages.len(), 2);
        assert_eq!(v2.stages.len(), 3);

        assert!(matches!(
            catalog.update_pipeline("other", request("other")),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete() {
        let (catalog, _bus) = catalog();
        catalog.create_pipeline(request("ci")).unwrap();

        catalog.delete_pipeline("ci").unwrap();
        assert!(catalog.list_pipelines().is_empty());
        assert_eq!(
            catalog.delete_pipeline("ci").unwrap_err(),
            PipelineError::NotFound("ci".to_string())
        );
    }
}

//! Pipeline Repository
//!
//! Catalog of pipeline definitions keyed by name. Stored pipelines are
//! shared snapshots: replacing a definition never changes a snapshot a run
//! already holds.

use quay_core::domain::pipeline::Pipeline;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Default)]
pub struct PipelineStore {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pipeline unless its name is taken. Returns false if it was.
    pub fn create(&self, pipeline: Pipeline) -> bool {
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if pipelines.contains_key(&pipeline.name) {
            return false;
        }
        pipelines.insert(pipeline.name.clone(), Arc::new(pipeline));
        true
    }

    /// Replace an existing pipeline, building the new version from the old one
    pub fn update<F>(&self, name: &str, build: F) -> Option<Arc<Pipeline>>
    where
        F: FnOnce(&Pipeline) -> Pipeline,
    {
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let current = pipelines.get(name)?;
        let next = Arc::new(build(current));
        pipelines.insert(name.to_string(), Arc::clone(&next));
        Some(next)
    }

    /// Find a pipeline by name
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// List all pipelines, ordered by name
    pub fn list_all(&self) -> Vec<Arc<Pipeline>> {
        let mut pipelines: Vec<Arc<Pipeline>> = self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        pipelines
    }

    /// Delete a pipeline by name
    pub fn delete(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

//! Run Repository
//!
//! Live working set of runs, addressed by id. Each run sits behind its own
//! lock so work on one run never waits on another; the maps themselves are
//! only locked long enough to look an entry up.

use quay_core::domain::run::Run;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

pub type RunHandle = Arc<Mutex<Run>>;

#[derive(Default)]
pub struct RunStore {
    runs: RwLock<HashMap<Uuid, RunHandle>>,
    steps: RwLock<HashMap<Uuid, Uuid>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created run and index its steps
    pub fn create(&self, run: Run) -> RunHandle {
        let run_id = run.id;
        let step_ids: Vec<Uuid> = run
            .stages
            .iter()
            .flat_map(|s| s.steps.iter().map(|step| step.id))
            .collect();

        let handle = Arc::new(Mutex::new(run));
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, Arc::clone(&handle));

        let mut steps = self.steps.write().unwrap_or_else(PoisonError::into_inner);
        for step_id in step_ids {
            steps.insert(step_id, run_id);
        }

        handle
    }

    /// Find a run by ID
    pub fn find_by_id(&self, run_id: Uuid) -> Option<RunHandle> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&run_id)
            .cloned()
    }

    /// Find the run owning a step
    pub fn find_by_step(&self, step_id: Uuid) -> Option<(Uuid, RunHandle)> {
        let run_id = *self
            .steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&step_id)?;
        self.find_by_id(run_id).map(|handle| (run_id, handle))
    }

    /// All live runs
    pub fn list_all(&self) -> Vec<(Uuid, RunHandle)> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, Arc::clone(handle)))
            .collect()
    }

    /// Remove a run and its step index entries
    pub fn delete(&self, run_id: Uuid) -> bool {
        let removed = self
            .runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id)
            .is_some();

        if removed {
            self.steps
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|_, owner| *owner != run_id);
        }

        removed
    }
}

//! Repository Module
//!
//! In-memory live working set for the orchestrator.
//! Each repository holds the entities of one domain.

pub mod pipeline;
pub mod run;

// Re-export for convenience
pub use pipeline as pipeline_repository;
pub use run as run_repository;

//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services own their state and talk to each other through the event bus.

pub mod agent;
pub mod event_bus;
pub mod log_stream;
pub mod pipeline;
pub mod run;
pub mod trigger;

// Re-export for convenience
pub use agent as agent_service;
pub use event_bus as event_service;
pub use log_stream as log_service;
pub use pipeline as pipeline_service;
pub use run as run_service;
pub use trigger as trigger_service;

//! Quay Orchestrator
//!
//! Event-driven pipeline run orchestration: run state machine, agent
//! registry, event bus and log streaming, plus their HTTP binding.

pub mod api;
pub mod config;
pub mod orchestrator;
pub mod repository;
pub mod service;

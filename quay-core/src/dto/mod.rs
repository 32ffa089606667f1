//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between the orchestrator,
//! its agents and tools. DTOs are lightweight request/response bodies
//! optimized for network transfer.

pub mod agent;
pub mod pipeline;
pub mod run;

//! Core domain types
//!
//! This module contains the core domain structures used across Quay services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns their lifecycle) and agents (which report on them).

pub mod agent;
pub mod event;
pub mod pipeline;
pub mod run;

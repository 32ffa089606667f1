//! Quay Core
//!
//! Core types and abstractions for the Quay pipeline orchestrator.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Run, Agent, Event)
//! - DTOs: Data transfer objects for orchestrator/agent communication
//! - Topics: Hierarchical event topic names and subscription patterns

pub mod domain;
pub mod dto;
pub mod topic;

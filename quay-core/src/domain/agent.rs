//! Agent domain model
//!
//! Represents an execution agent that runs steps dispatched by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// An agent that can execute steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier for the agent
    pub id: String,

    /// Capability labels this agent advertises
    pub capabilities: BTreeSet<String>,

    /// When this agent was registered
    pub registered_at: DateTime<Utc>,

    /// Last time this agent sent a heartbeat
    pub last_heartbeat_at: DateTime<Utc>,

    /// Current status of the agent
    pub status: AgentStatus,

    /// Step currently assigned to this agent, by id
    pub assigned_step: Option<Uuid>,
}

/// Status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Registration accepted, not yet eligible for work
    Registering,

    /// Agent is online and ready to accept a step
    Idle,

    /// Agent is currently executing a step
    Busy,

    /// Agent missed too many heartbeats
    Disconnected,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Registering => write!(f, "Registering"),
            AgentStatus::Idle => write!(f, "Idle"),
            AgentStatus::Busy => write!(f, "Busy"),
            AgentStatus::Disconnected => write!(f, "Disconnected"),
        }
    }
}

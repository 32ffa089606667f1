//! Agent DTOs
//!
//! Data transfer objects for agent-related operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentStatus};

/// Request to register an agent with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgent {
    /// Unique identifier for the agent
    pub agent_id: String,

    /// Capability labels this agent supports (e.g. "linux", "docker")
    pub capabilities: Vec<String>,
}

/// Periodic liveness report from an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Free-form load metrics (cpu, memory, ...)
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Orchestrator reply to a heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: AgentStatus,

    /// Step the agent currently holds
    pub assigned_step: Option<Uuid>,

    /// Step the agent should stop working on, if cancellation was requested
    pub cancel_step: Option<Uuid>,
}

/// Summary information about an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: String,
    pub capability_count: usize,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub assigned_step: Option<Uuid>,
}

impl From<Agent> for AgentSummary {
    fn from(agent: Agent) -> Self {
        AgentSummary {
            id: agent.id,
            capability_count: agent.capabilities.len(),
            last_heartbeat_at: agent.last_heartbeat_at,
            status: agent.status,
            assigned_step: agent.assigned_step,
        }
    }
}

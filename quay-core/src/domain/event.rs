//! Event domain types
//!
//! Every state change and every chunk of step output travels as an [`Event`].
//! Sequence numbers are assigned by the event bus at publish time; producers
//! only ever hand over an [`EventDraft`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topic::Topic;

/// Stream id for events that do not belong to a run
/// (`agent.*`, `pipeline.*`, `webhook.*`, ...)
pub const SYSTEM_STREAM: Uuid = Uuid::nil();

/// Sequenced, immutable event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub topic: Topic,
    pub run_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// An event before the bus has sequenced it
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub topic: Topic,
    pub run_id: Uuid,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn for_run(run_id: Uuid, topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            run_id,
            payload,
        }
    }

    pub fn system(topic: Topic, payload: serde_json::Value) -> Self {
        Self {
            topic,
            run_id: SYSTEM_STREAM,
            payload,
        }
    }
}

/// Payload of a `run.{id}.step.{id}.output` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub step_id: Uuid,
    /// Per-step sequence, independent of the run-level event sequence
    pub step_sequence: u64,
    pub line: String,
}

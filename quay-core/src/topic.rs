//! Event topics and subscription patterns
//!
//! Topics are hierarchical names separated by dots, for example
//! `run.7f0c....stage.build.started`. Patterns support two wildcards:
//! - `*` matches exactly one segment
//! - `**` matches zero or more segments
//!
//! The `topics` submodule builds the topic names the orchestrator publishes on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SEGMENT_SEPARATOR: char = '.';
pub const WILDCARD_SINGLE: &str = "*";
pub const WILDCARD_MULTI: &str = "**";
pub const MAX_SEGMENT_LENGTH: usize = 128;
pub const MAX_TOPIC_SEGMENTS: usize = 16;

/// Errors produced while parsing topics or patterns
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,

    #[error("topic has {0} segments, maximum is {MAX_TOPIC_SEGMENTS}")]
    TooManySegments(usize),

    #[error("invalid segment '{segment}' at position {position}")]
    InvalidSegment { segment: String, position: usize },
}

/// Check whether a string can be used as one topic segment.
///
/// Segments are non-empty, at most `MAX_SEGMENT_LENGTH` bytes, and contain
/// only alphanumerics, `-` and `_`.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LENGTH
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A concrete topic an event is published on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TopicError::Empty);
        }

        let count = name.split(SEGMENT_SEPARATOR).count();
        if count > MAX_TOPIC_SEGMENTS {
            return Err(TopicError::TooManySegments(count));
        }

        for (position, segment) in name.split(SEGMENT_SEPARATOR).enumerate() {
            if !is_valid_segment(segment) {
                return Err(TopicError::InvalidSegment {
                    segment: segment.to_string(),
                    position,
                });
            }
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEGMENT_SEPARATOR)
    }

    /// Last segment, which names the event kind (`started`, `output`, ...)
    pub fn kind(&self) -> &str {
        self.0.rsplit(SEGMENT_SEPARATOR).next().unwrap_or_default()
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Single,
    Multi,
}

/// A subscription pattern over topics
///
/// # Example
///
/// ```
/// use quay_core::topic::{Topic, TopicPattern};
///
/// let pattern = TopicPattern::new("run.*.stage.*.started").unwrap();
/// assert!(pattern.matches(&Topic::new("run.r1.stage.build.started").unwrap()));
/// assert!(!pattern.matches(&Topic::new("run.r1.stage.build.completed").unwrap()));
///
/// let pattern = TopicPattern::new("run.r1.**").unwrap();
/// assert!(pattern.matches(&Topic::new("run.r1.step.s1.output").unwrap()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<PatternSegment>,
    original: String,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, TopicError> {
        let original = pattern.into();
        if original.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = original.split(SEGMENT_SEPARATOR).collect();
        if parts.len() > MAX_TOPIC_SEGMENTS {
            return Err(TopicError::TooManySegments(parts.len()));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for (position, part) in parts.iter().enumerate() {
            let segment = match *part {
                WILDCARD_SINGLE => PatternSegment::Single,
                WILDCARD_MULTI => PatternSegment::Multi,
                literal if is_valid_segment(literal) => {
                    PatternSegment::Literal(literal.to_string())
                }
                other => {
                    return Err(TopicError::InvalidSegment {
                        segment: other.to_string(),
                        position,
                    });
                }
            };
            segments.push(segment);
        }

        Ok(Self { segments, original })
    }

    /// Pattern matching every topic
    pub fn all() -> Self {
        Self {
            segments: vec![PatternSegment::Multi],
            original: WILDCARD_MULTI.to_string(),
        }
    }

    pub fn matches(&self, topic: &Topic) -> bool {
        let topic_segments: Vec<&str> = topic.segments().collect();
        Self::matches_from(&self.segments, &topic_segments)
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    fn matches_from(pattern: &[PatternSegment], topic: &[&str]) -> bool {
        match pattern.split_first() {
            None => topic.is_empty(),
            Some((PatternSegment::Literal(lit), rest)) => topic
                .split_first()
                .is_some_and(|(head, tail)| head == lit && Self::matches_from(rest, tail)),
            Some((PatternSegment::Single, rest)) => topic
                .split_first()
                .is_some_and(|(_, tail)| Self::matches_from(rest, tail)),
            Some((PatternSegment::Multi, rest)) => {
                (0..=topic.len()).any(|skip| Self::matches_from(rest, &topic[skip..]))
            }
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Builders for the topics published by the orchestrator.
///
/// Inputs are identifiers the orchestrator has already validated (UUIDs,
/// stage names checked by the pipeline graph, agent ids checked at
/// registration), so the result is always a well-formed topic.
pub mod topics {
    use super::Topic;
    use uuid::Uuid;

    pub fn run(run_id: Uuid, kind: &str) -> Topic {
        Topic(format!("run.{run_id}.{kind}"))
    }

    pub fn stage(run_id: Uuid, stage: &str, kind: &str) -> Topic {
        Topic(format!("run.{run_id}.stage.{stage}.{kind}"))
    }

    pub fn step(run_id: Uuid, step_id: Uuid, kind: &str) -> Topic {
        Topic(format!("run.{run_id}.step.{step_id}.{kind}"))
    }

    pub fn step_output(run_id: Uuid, step_id: Uuid) -> Topic {
        step(run_id, step_id, "output")
    }

    pub fn agent(kind: &str) -> Topic {
        Topic(format!("agent.{kind}"))
    }

    pub fn agent_scoped(agent_id: &str, kind: &str) -> Topic {
        Topic(format!("agent.{agent_id}.{kind}"))
    }

    pub fn pipeline(kind: &str) -> Topic {
        Topic(format!("pipeline.{kind}"))
    }

    pub const WEBHOOK_GITHUB: &str = "webhook.github";
    pub const STEP_OUTPUT_PATTERN: &str = "run.*.step.*.output";
}

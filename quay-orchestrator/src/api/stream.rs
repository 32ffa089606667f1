//! Streaming API Handlers
//!
//! Server-sent event streams over bus subscriptions and step log tails, and
//! the webhook intake that feeds the trigger consumer.
//!
//! Each SSE stream maps to exactly one subscription or tail. Gaps are sent
//! as events named `gap`; envelopes as events named by their topic.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::{self, Stream, StreamExt};
use quay_core::domain::event::{Event, EventDraft};
use quay_core::topic::{Topic, TopicPattern, topics};
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::event_bus::{Cursor, Delivery, EventBusError, Gap};
use crate::service::log_stream::{LogStreamError, TailItem};

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Topic pattern, every topic when absent
    pub pattern: Option<String>,
    pub run_id: Option<Uuid>,
    /// First sequence of `run_id` to replay
    pub from: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub from: Option<u64>,
}

fn shutdown_signal(mut shutdown: watch::Receiver<bool>) -> impl Future<Output = ()> {
    async move {
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }
}

fn envelope_event(event: &Event) -> Result<SseEvent, axum::Error> {
    SseEvent::default()
        .event(event.topic.as_str())
        .id(event.sequence.to_string())
        .json_data(event)
}

fn gap_event(gap: &Gap) -> Result<SseEvent, axum::Error> {
    SseEvent::default().event("gap").json_data(gap)
}

fn tail_event(step_id: Uuid, item: &TailItem) -> Result<SseEvent, axum::Error> {
    match item {
        TailItem::Chunk(chunk) => SseEvent::default()
            .event("output")
            .id(chunk.step_sequence.to_string())
            .json_data(chunk),
        TailItem::Gap { from, to } => SseEvent::default().event("gap").json_data(
            serde_json::json!({ "step_id": step_id, "from": from, "to": to }),
        ),
    }
}

/// GET /events?pattern=P&run_id=R&from=N
/// Stream bus events matching a pattern, optionally replaying one run
pub async fn subscribe_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let pattern = match query.pattern {
        Some(pattern) => TopicPattern::new(pattern).map_err(EventBusError::from)?,
        None => TopicPattern::all(),
    };
    let cursor = match (query.run_id, query.from) {
        (Some(run_id), Some(sequence)) => Some(Cursor { run_id, sequence }),
        (None, Some(_)) => {
            return Err(ApiError::BadRequest(
                "`from` requires `run_id`".to_string(),
            ));
        }
        _ => None,
    };

    tracing::info!("Opening event stream for pattern: {}", pattern);

    let subscription = state.orchestrator.bus.subscribe(pattern, cursor)?;

    let events = stream::unfold(subscription, |mut subscription| async move {
        loop {
            let sse = match subscription.recv().await {
                Ok(Delivery::Event(event)) => {
                    subscription.acknowledge(event.run_id, event.sequence);
                    envelope_event(&event)
                }
                Ok(Delivery::Gap(gap)) => gap_event(&gap),
                Err(e) => {
                    tracing::debug!("Event stream {} ended: {}", subscription.id(), e);
                    return None;
                }
            };
            match sse {
                Ok(sse) => return Some((Ok::<_, Infallible>(sse), subscription)),
                Err(e) => tracing::warn!("Could not encode event: {}", e),
            }
        }
    })
    .take_until(shutdown_signal(state.shutdown.clone()));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// GET /step/{id}/logs?from=N
/// Replay a step's retained output, then follow it live
pub async fn tail_step_logs(
    State(state): State<AppState>,
    Path(step_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let from = query.from.unwrap_or(1);
    tracing::info!("Tailing logs of step {} from {}", step_id, from);

    let tail = state.orchestrator.tail_step(step_id, from)?;
    let orchestrator = Arc::clone(&state.orchestrator);

    let items = stream::unfold(tail, move |mut tail| {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            loop {
                match tail.recv().await {
                    Ok(Some(item)) => match tail_event(step_id, &item) {
                        Ok(sse) => return Some((Ok::<_, Infallible>(sse), tail)),
                        Err(e) => tracing::warn!("Could not encode output: {}", e),
                    },
                    Ok(None) => return None,
                    Err(LogStreamError::Lagged { resume_from, .. }) => {
                        // Reopen from the window; the gap, if any, is reported
                        match orchestrator.tail_step(step_id, resume_from) {
                            Ok(next) => tail = next,
                            Err(e) => {
                                tracing::warn!("Could not reopen tail of {}: {}", step_id, e);
                                return None;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Log tail of {} failed: {}", step_id, e);
                        return None;
                    }
                }
            }
        }
    })
    .take_until(shutdown_signal(state.shutdown.clone()));

    Ok(Sse::new(items).keep_alive(KeepAlive::default()))
}

/// POST /webhook/github
/// Accept an already authenticated webhook payload onto the bus
pub async fn receive_github_webhook(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let topic = Topic::new(topics::WEBHOOK_GITHUB)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    let event = state
        .orchestrator
        .bus
        .publish(EventDraft::system(topic, payload))?;

    tracing::info!("Webhook accepted as event {}", event.sequence);

    Ok((StatusCode::ACCEPTED, Json((*event).clone())))
}

//! Webhook Trigger
//!
//! Turns `webhook.github` events into runs. The webhook collaborator has
//! already parsed and authenticated the request; its payload names the
//! pipeline and the commit to build.

use quay_core::domain::event::Event;
use quay_core::domain::run::{Run, TriggerMetadata};
use quay_core::topic::{TopicPattern, topics};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::service::event_bus::{Delivery, EventBus, SubscriptionError};
use crate::service::pipeline::PipelineCatalog;
use crate::service::run::RunStateMachine;

/// Payload expected on `webhook.github`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTrigger {
    pub pipeline: String,
    pub commit: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl From<WebhookTrigger> for TriggerMetadata {
    fn from(trigger: WebhookTrigger) -> Self {
        TriggerMetadata {
            commit: trigger.commit,
            source: trigger.source.unwrap_or_else(|| "github".to_string()),
            metadata: trigger.metadata,
        }
    }
}

/// Create a run for one webhook event
///
/// Malformed payloads and unknown pipelines are logged and dropped.
pub fn handle_webhook(
    catalog: &PipelineCatalog,
    machine: &RunStateMachine,
    event: &Event,
) -> Option<Run> {
    let trigger: WebhookTrigger = match serde_json::from_value(event.payload.clone()) {
        Ok(trigger) => trigger,
        Err(e) => {
            tracing::warn!("Dropping malformed webhook payload: {}", e);
            return None;
        }
    };

    let pipeline = match catalog.get_pipeline(&trigger.pipeline) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::warn!("Dropping webhook for commit {}: {}", trigger.commit, e);
            return None;
        }
    };

    match machine.create_run(pipeline, trigger.into()) {
        Ok(run) => Some(run),
        Err(e) => {
            tracing::warn!("Webhook run creation failed: {}", e);
            None
        }
    }
}

/// Consume `webhook.github` until shutdown
pub async fn run_consumer(
    bus: EventBus,
    catalog: Arc<PipelineCatalog>,
    machine: RunStateMachine,
    mut shutdown: watch::Receiver<bool>,
) {
    let pattern = match TopicPattern::new(topics::WEBHOOK_GITHUB) {
        Ok(pattern) => pattern,
        Err(e) => {
            tracing::error!("Webhook pattern rejected: {}", e);
            return;
        }
    };

    let mut subscription = match bus.subscribe(pattern.clone(), None) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!("Webhook consumer could not subscribe: {}", e);
            return;
        }
    };

    tracing::info!("Webhook trigger consumer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = subscription.recv() => match delivery {
                Ok(Delivery::Event(event)) => {
                    if let Some(run) = handle_webhook(&catalog, &machine, &event) {
                        tracing::info!(run_id = %run.id, "Run triggered by webhook");
                    }
                    subscription.acknowledge(event.run_id, event.sequence);
                }
                Ok(Delivery::Gap(gap)) => {
                    tracing::warn!("Webhook consumer missed events {}..={}", gap.from, gap.to);
                }
                Err(SubscriptionError::Overflow) => {
                    // Pick up from the last handled webhook
                    let cursor = subscription.resume_cursor(quay_core::domain::event::SYSTEM_STREAM);
                    match bus.subscribe(pattern.clone(), Some(cursor)) {
                        Ok(next) => subscription = next,
                        Err(e) => {
                            tracing::error!("Webhook consumer could not resubscribe: {}", e);
                            break;
                        }
                    }
                }
                Err(SubscriptionError::Closed) => break,
            },
        }
    }

    tracing::info!("Webhook trigger consumer stopped");
}

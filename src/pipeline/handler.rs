//! Inbound use-case handler: persist the message, then hand it to its
//! conversation. Every delivery runs inside the ingestion guard.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::conversation::state::WorkItem;
use crate::conversation::workflow::RFQ_CONVERSATION;
use crate::conversation::{complete_thread_start, new_message_start};
use crate::durable::runtime::{StartOptions, StartOutcome, WorkflowRuntime};
use crate::error::InboxError;
use crate::inbox::guard::{EventDescriptor, GuardOutcome, IngestionGuard};
use crate::pipeline::types::{Delivery, InboundEvent};
use crate::store::traits::{Database, MessageStatus};

/// Path of the channel-native id inside an event payload.
const EVENT_ID_PATH: &str = "id";

/// What a successful delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledEvent {
    pub kind: &'static str,
    pub thread_id: String,
    /// Internal id of the stored message, for `Message` events.
    pub message_id: Option<String>,
    /// Whether a signal was sent to the conversation. False when the
    /// message had already been queued by an earlier attempt or the poller.
    pub forwarded: bool,
}

pub struct InboundHandler {
    guard: IngestionGuard,
    db: Arc<dyn Database>,
    runtime: Arc<WorkflowRuntime>,
    conversation_queue: String,
}

impl InboundHandler {
    pub fn new(
        guard: IngestionGuard,
        db: Arc<dyn Database>,
        runtime: Arc<WorkflowRuntime>,
        conversation_queue: impl Into<String>,
    ) -> Self {
        Self {
            guard,
            db,
            runtime,
            conversation_queue: conversation_queue.into(),
        }
    }

    /// Handle one broker delivery under the ingestion guard.
    pub async fn handle(&self, delivery: &Delivery) -> Result<GuardOutcome<HandledEvent>, InboxError> {
        let event: InboundEvent = serde_json::from_value(delivery.payload.clone())
            .map_err(|e| InboxError::InvalidPayload(e.to_string()))?;

        debug!(
            topic = %delivery.topic,
            attempt = delivery.attempt,
            kind = event.label(),
            thread_id = %event.thread_id(),
            "Handling delivery"
        );

        let mut descriptor = EventDescriptor::new(event.channel())
            .with_id_path(EVENT_ID_PATH)
            .with_max_retries(self.guard.config().default_max_retries);
        // Distinct channel ids are distinct messages even with equal bodies;
        // the content hash only stands in when the channel sent no id.
        if event.id().is_none() {
            descriptor = descriptor.with_hash_dedup();
        }

        // Stable across handler retries so a partial first attempt is reused.
        let fallback_id = uuid::Uuid::new_v4().to_string();
        let event = &event;
        let fallback_id = fallback_id.as_str();
        self.guard
            .guard(&descriptor, &delivery.payload, move || self.process(event, fallback_id))
            .await
    }

    async fn process(&self, event: &InboundEvent, fallback_id: &str) -> Result<HandledEvent, InboxError> {
        match event {
            InboundEvent::Message { id, thread_id, .. } => {
                let external_id = id.as_deref().unwrap_or(fallback_id);
                let Some(new_message) = event.to_new_message(external_id) else {
                    return Err(InboxError::InvalidPayload("message event without body".into()));
                };
                let message_id = self.db.insert_message(&new_message).await?;

                if !self.db.claim_message(&message_id).await? {
                    debug!(message_id = %message_id, "Message already queued, not signalling again");
                    return Ok(HandledEvent {
                        kind: event.label(),
                        thread_id: thread_id.clone(),
                        message_id: Some(message_id),
                        forwarded: false,
                    });
                }

                let item = WorkItem::new(thread_id.clone(), message_id.clone());
                let outcome = match self.signal(new_message_start(&item, &self.conversation_queue)?).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Leave it for the poller.
                        if let Err(revert) = self
                            .db
                            .update_message_status(&message_id, MessageStatus::Pending)
                            .await
                        {
                            warn!(message_id = %message_id, error = %revert, "Failed to return message to pending");
                        }
                        return Err(e);
                    }
                };

                info!(
                    thread_id = %thread_id,
                    message_id = %message_id,
                    outcome = ?outcome,
                    "Message forwarded to conversation"
                );
                Ok(HandledEvent {
                    kind: event.label(),
                    thread_id: thread_id.clone(),
                    message_id: Some(message_id),
                    forwarded: true,
                })
            }
            InboundEvent::ThreadCompleted { thread_id, .. } => {
                let outcome = self
                    .signal(complete_thread_start(thread_id, &self.conversation_queue)?)
                    .await?;
                info!(thread_id = %thread_id, outcome = ?outcome, "Thread completion forwarded");
                Ok(HandledEvent {
                    kind: event.label(),
                    thread_id: thread_id.clone(),
                    message_id: None,
                    forwarded: true,
                })
            }
        }
    }

    async fn signal(&self, options: StartOptions) -> Result<StartOutcome, InboxError> {
        Ok(self.runtime.start_or_signal(RFQ_CONVERSATION, options).await?)
    }
}

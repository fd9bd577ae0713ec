//! Broker consumer loop.
//!
//! Pulls deliveries from the broker channel, runs each through the
//! [`InboundHandler`], and reports the result back so the broker can drop
//! or redeliver it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::InboxError;
use crate::inbox::guard::GuardOutcome;
use crate::pipeline::handler::{HandledEvent, InboundHandler};
use crate::pipeline::types::{Delivery, DeliveryReport, DeliveryResult};

/// Map a handler result to the broker's next step.
pub fn classify(result: &Result<GuardOutcome<HandledEvent>, InboxError>) -> DeliveryResult {
    match result {
        Ok(GuardOutcome::Executed(_)) => DeliveryResult::Ack,
        Ok(GuardOutcome::Duplicate { message_id }) => DeliveryResult::Duplicate {
            message_id: message_id.to_string(),
        },
        Err(e @ InboxError::EventLocked { .. }) => DeliveryResult::Redeliver { reason: e.to_string() },
        Err(e) if e.is_retryable() => DeliveryResult::Redeliver { reason: e.to_string() },
        Err(e) => DeliveryResult::Reject { reason: e.to_string() },
    }
}

/// Spawn the consumer. It stops when the broker channel closes or the
/// returned token is cancelled.
pub fn spawn_consumer(
    handler: Arc<InboundHandler>,
    mut deliveries: mpsc::Receiver<Delivery>,
    reports: mpsc::UnboundedSender<DeliveryReport>,
) -> (JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!("Broker consumer started");

        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => {
                    info!("Broker consumer shutting down");
                    return;
                }
                next = deliveries.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!("Broker channel closed, consumer stopping");
                        return;
                    }
                },
            };

            let result = classify(&handler.handle(&delivery).await);
            match &result {
                DeliveryResult::Ack => debug!(topic = %delivery.topic, "Delivery acknowledged"),
                DeliveryResult::Duplicate { message_id } => {
                    info!(topic = %delivery.topic, message_id = %message_id, "Duplicate delivery dropped")
                }
                DeliveryResult::Redeliver { reason } => warn!(
                    topic = %delivery.topic,
                    attempt = delivery.attempt,
                    reason = %reason,
                    "Delivery not handled, requesting redelivery"
                ),
                DeliveryResult::Reject { reason } => {
                    error!(topic = %delivery.topic, reason = %reason, "Delivery rejected")
                }
            }

            if reports.send(DeliveryReport { delivery, result }).is_err() {
                warn!("Broker report channel closed");
            }
        }
    });

    (handle, shutdown)
}

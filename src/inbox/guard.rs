//! Ingestion guard: effectively-once handler execution under at-least-once
//! delivery.
//!
//! Every inbound delivery is identified by a message id extracted from the
//! payload. The first delivery claims a `processing` record, which acts as
//! the lease; concurrent duplicates fail fast with `EventLocked`, and
//! deliveries of an already completed event are acknowledged without
//! running the handler again.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::InboxConfig;
use crate::error::InboxError;
use crate::inbox::model::{EventHash, EventInboxRecord, EventSource, EventStatus, MessageId};
use crate::store::traits::EventInboxRepository;

/// Declares how to identify and retry one kind of inbound event.
#[derive(Debug, Clone)]
pub struct EventDescriptor {
    /// Origin channel name stored on the record.
    pub source: String,
    /// Dot-separated path to the event id inside the payload, e.g. `message.id`.
    /// Without a path (or when the path does not resolve) every delivery is unique.
    pub id_path: Option<String>,
    /// Handler attempts per delivery. Values below 1 are treated as 1.
    pub max_retries: u32,
    /// Treat a completed record with the same content hash as a duplicate.
    pub dedup_by_hash: bool,
}

impl EventDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            id_path: None,
            max_retries: 1,
            dedup_by_hash: false,
        }
    }

    pub fn with_id_path(mut self, path: impl Into<String>) -> Self {
        self.id_path = Some(path.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_hash_dedup(mut self) -> Self {
        self.dedup_by_hash = true;
        self
    }
}

/// Result of a guarded delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome<T> {
    /// The handler ran and succeeded.
    Executed(T),
    /// The event was already handled; the handler did not run.
    Duplicate { message_id: MessageId },
}

impl<T> GuardOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Resolve a dot-separated path to a string or number leaf.
pub fn extract_event_id(event: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = event;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Copy of `event` with the leaf at `path` removed, so the content hash
/// ignores the delivery id.
fn without_path(event: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut stripped = event.clone();
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return stripped;
    };
    let parent: String = parents
        .iter()
        .map(|s| format!("/{}", s.replace('~', "~0").replace('/', "~1")))
        .collect();
    if let Some(serde_json::Value::Object(map)) = stripped.pointer_mut(&parent) {
        map.remove(*leaf);
    }
    stripped
}

enum Acquired {
    Claimed(EventInboxRecord),
    Duplicate(MessageId),
}

/// Wraps inbound handlers with the event inbox.
pub struct IngestionGuard {
    repo: Arc<dyn EventInboxRepository>,
    config: InboxConfig,
}

impl IngestionGuard {
    pub fn new(repo: Arc<dyn EventInboxRepository>, config: InboxConfig) -> Self {
        Self { repo, config }
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    /// Run `handler` for `event` at most once effectively.
    ///
    /// The handler is retried locally up to `descriptor.max_retries` times
    /// unless it fails with a non-retryable error. The final status is
    /// persisted best-effort; a bookkeeping failure never replaces the
    /// handler's own result.
    pub async fn guard<T, F, Fut>(
        &self,
        descriptor: &EventDescriptor,
        event: &serde_json::Value,
        mut handler: F,
    ) -> Result<GuardOutcome<T>, InboxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InboxError>>,
    {
        let source = EventSource::new(descriptor.source.clone())?;
        let message_id = match descriptor
            .id_path
            .as_deref()
            .and_then(|path| extract_event_id(event, path))
        {
            Some(id) => MessageId::new(id)?,
            None => {
                let id = MessageId::generate();
                debug!(source = %source, message_id = %id, "No event id found, treating delivery as unique");
                id
            }
        };
        let hash = match descriptor.id_path.as_deref() {
            Some(path) => EventHash::of(&without_path(event, path)),
            None => EventHash::of(event),
        };

        let mut record = match self.acquire(descriptor, message_id, source, hash).await? {
            Acquired::Claimed(record) => record,
            Acquired::Duplicate(message_id) => {
                return Ok(GuardOutcome::Duplicate { message_id });
            }
        };

        let attempts = descriptor.max_retries.max(1);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let result = match AssertUnwindSafe(async { handler().await }).catch_unwind().await {
                Ok(result) => result,
                // A panic releases the lease like any other fatal failure.
                Err(panic) => {
                    break InboxError::Handler(anyhow::anyhow!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
            };
            match result {
                Ok(value) => {
                    record.mark_completed()?;
                    self.finalize(&record).await;
                    info!(
                        message_id = %record.message_id(),
                        source = %record.source(),
                        attempt,
                        "Event handled"
                    );
                    return Ok(GuardOutcome::Executed(value));
                }
                Err(e) if !e.is_retryable() => {
                    warn!(message_id = %record.message_id(), error = %e, "Handler failed with a non-retryable error");
                    break e;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        message_id = %record.message_id(),
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Handler failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => break e,
            }
        };

        error!(
            message_id = %record.message_id(),
            source = %record.source(),
            attempts = attempt,
            error = %failure,
            "Event handling failed"
        );
        record.mark_failed(failure.to_string())?;
        self.finalize(&record).await;
        Err(failure)
    }

    /// Take the processing lease for `message_id`, or report why not.
    async fn acquire(
        &self,
        descriptor: &EventDescriptor,
        message_id: MessageId,
        source: EventSource,
        hash: EventHash,
    ) -> Result<Acquired, InboxError> {
        match self.repo.find_by_message_id(&message_id).await? {
            Some(existing) => match existing.status() {
                EventStatus::Processing => {
                    info!(message_id = %message_id, "Duplicate delivery while processing, rejecting");
                    Err(InboxError::EventLocked {
                        message_id: message_id.to_string(),
                    })
                }
                EventStatus::Completed => {
                    info!(message_id = %message_id, "Event already completed, skipping handler");
                    Ok(Acquired::Duplicate(message_id))
                }
                EventStatus::Failed => {
                    let mut record = existing;
                    record.reopen()?;
                    if self.repo.claim(&record, Some(EventStatus::Failed)).await? {
                        info!(message_id = %message_id, attempts = record.attempts(), "Retrying previously failed event");
                        Ok(Acquired::Claimed(record))
                    } else {
                        Err(InboxError::EventLocked {
                            message_id: message_id.to_string(),
                        })
                    }
                }
            },
            None => {
                let mut record =
                    EventInboxRecord::new(message_id.clone(), source, hash.clone(), self.config.ttl);

                let original = self
                    .repo
                    .find_by_event_hash(&hash)
                    .await?
                    .into_iter()
                    .find(|r| r.status() == EventStatus::Completed && r.message_id() != &message_id);

                if let Some(original) = original {
                    let original_id = serde_json::Value::String(original.message_id().to_string());
                    if descriptor.dedup_by_hash {
                        record.set_metadata("duplicate_of", original_id);
                        record.mark_completed()?;
                        if self.repo.claim(&record, None).await? {
                            info!(
                                message_id = %message_id,
                                duplicate_of = %original.message_id(),
                                "Same payload already handled under another id, skipping handler"
                            );
                            return Ok(Acquired::Duplicate(message_id));
                        }
                        return Err(InboxError::EventLocked {
                            message_id: message_id.to_string(),
                        });
                    }
                    debug!(
                        message_id = %message_id,
                        hash_match = %original.message_id(),
                        "Payload matches a completed event under another id"
                    );
                    record.set_metadata("hash_match_of", original_id);
                }

                if self.repo.claim(&record, None).await? {
                    Ok(Acquired::Claimed(record))
                } else {
                    info!(message_id = %message_id, "Lost the claim race for a new event");
                    Err(InboxError::EventLocked {
                        message_id: message_id.to_string(),
                    })
                }
            }
        }
    }

    /// Persist the final status, retrying a few times. Failures are logged only.
    async fn finalize(&self, record: &EventInboxRecord) {
        let attempts = self.config.finalize_retries.max(1);
        for attempt in 1..=attempts {
            match self.repo.save(record).await {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    warn!(message_id = %record.message_id(), attempt, error = %e, "Failed to persist inbox status, retrying");
                    tokio::time::sleep(self.config.finalize_delay).await;
                }
                Err(e) => {
                    error!(
                        message_id = %record.message_id(),
                        status = %record.status(),
                        error = %e,
                        "Giving up persisting inbox status"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

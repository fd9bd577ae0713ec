//! Event inbox data model: validated identity values and the inbox record.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAX_INBOX_TTL;
use crate::error::InboxError;
use crate::inbox::hash;

/// Longest accepted message id.
pub const MESSAGE_ID_MAX_LEN: usize = 255;

/// Longest accepted source name.
pub const SOURCE_MAX_LEN: usize = 100;

fn validate_text(field: &'static str, value: &str, max_len: usize) -> Result<(), InboxError> {
    if value.trim().is_empty() {
        return Err(InboxError::InvalidValue {
            field,
            reason: "must not be empty".into(),
        });
    }
    if value.chars().count() > max_len {
        return Err(InboxError::InvalidValue {
            field,
            reason: format!("must be at most {max_len} characters"),
        });
    }
    Ok(())
}

/// Deduplication key of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Result<Self, InboxError> {
        let value = value.into();
        validate_text("message_id", &value, MESSAGE_ID_MAX_LEN)?;
        Ok(Self(value))
    }

    /// Fresh random id for events that carry none.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MessageId {
    type Error = InboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the channel an event came from (e.g. `gmail`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventSource(String);

impl EventSource {
    pub fn new(value: impl Into<String>) -> Result<Self, InboxError> {
        let value = value.into();
        validate_text("source", &value, SOURCE_MAX_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventSource {
    type Error = InboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventSource> for String {
    fn from(source: EventSource) -> Self {
        source.0
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 content hash of a canonicalized payload, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventHash(String);

impl EventHash {
    /// Hash a payload. Key order in objects does not affect the result.
    pub fn of(payload: &serde_json::Value) -> Self {
        Self(hash::sha256_hex(&hash::canonical_json(payload)))
    }

    /// Accept a previously computed hash.
    pub fn parse(value: impl Into<String>) -> Result<Self, InboxError> {
        let value = value.into();
        let well_formed = value.len() == 64
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return Err(InboxError::InvalidValue {
                field: "event_hash",
                reason: "must be 64 lowercase hex characters".into(),
            });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventHash {
    type Error = InboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventHash> for String {
    fn from(hash: EventHash) -> Self {
        hash.0
    }
}

impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing status of an inbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// A handler holds the lease.
    Processing,
    /// The handler succeeded. Terminal.
    Completed,
    /// The handler gave up; a later delivery may retry.
    Failed,
}

impl EventStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: EventStatus) -> bool {
        use EventStatus::*;

        matches!(
            (self, target),
            (Processing, Completed) | (Processing, Failed) | (Failed, Processing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = InboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(InboxError::InvalidValue {
                field: "status",
                reason: format!("unknown status '{other}'"),
            }),
        }
    }
}

/// Raw column values for rebuilding a record from storage.
#[derive(Debug, Clone)]
pub struct RecordParts {
    pub message_id: String,
    pub source: String,
    pub event_hash: String,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One ingestion attempt for an inbound event.
///
/// Status changes go through `mark_completed`, `mark_failed`, and
/// `reopen`, which enforce the allowed transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventInboxRecord {
    message_id: MessageId,
    source: EventSource,
    event_hash: EventHash,
    status: EventStatus,
    processed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    metadata: serde_json::Value,
    attempts: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventInboxRecord {
    /// A new record in `processing`, expiring `ttl` from now.
    pub fn new(message_id: MessageId, source: EventSource, event_hash: EventHash, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl.min(MAX_INBOX_TTL)).unwrap_or(chrono::Duration::MAX);
        Self {
            message_id,
            source,
            event_hash,
            status: EventStatus::Processing,
            processed_at: None,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            attempts: 1,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a record from stored columns, re-validating every value.
    pub fn restore(parts: RecordParts) -> Result<Self, InboxError> {
        let metadata = match parts.metadata {
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => {
                return Err(InboxError::InvalidValue {
                    field: "metadata",
                    reason: format!("expected a JSON object, got {other}"),
                });
            }
        };

        Ok(Self {
            message_id: MessageId::new(parts.message_id)?,
            source: EventSource::new(parts.source)?,
            event_hash: EventHash::parse(parts.event_hash)?,
            status: parts.status.parse()?,
            processed_at: parts.processed_at,
            expires_at: parts.expires_at,
            metadata,
            attempts: parts.attempts,
            last_error: parts.last_error,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn source(&self) -> &EventSource {
        &self.source
    }

    pub fn event_hash(&self) -> &EventHash {
        &self.event_hash
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.metadata
    }

    /// Times the record has entered `processing`.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Set a top-level metadata key.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut self.metadata {
            map.insert(key.into(), value);
        }
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, to: EventStatus) -> Result<(), InboxError> {
        if !self.status.can_transition_to(to) {
            return Err(InboxError::InvalidStatusTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `processing → completed`.
    pub fn mark_completed(&mut self) -> Result<(), InboxError> {
        self.transition(EventStatus::Completed)?;
        self.processed_at = Some(self.updated_at);
        self.last_error = None;
        Ok(())
    }

    /// `processing → failed`, remembering the error.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), InboxError> {
        self.transition(EventStatus::Failed)?;
        self.processed_at = Some(self.updated_at);
        self.last_error = Some(error.into());
        Ok(())
    }

    /// `failed → processing` for a redelivered event.
    pub fn reopen(&mut self) -> Result<(), InboxError> {
        self.transition(EventStatus::Processing)?;
        self.processed_at = None;
        self.attempts = self.attempts.saturating_add(1);
        Ok(())
    }
}

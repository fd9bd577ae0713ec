//! Persistence traits: inbound message storage and the event inbox.
//!
//! Both traits are implemented by `LibSqlBackend`; callers hold them as
//! `Arc<dyn Database>` / `Arc<dyn EventInboxRepository>`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CleanupConfig;
use crate::error::DatabaseError;
use crate::inbox::model::{EventHash, EventInboxRecord, EventStatus, MessageId};

/// Status of a stored inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Stored, not yet handed to a conversation.
    Pending,
    /// Signalled to its conversation; awaiting parsing.
    Queued,
    /// Parsed and handed to triage.
    Triaged,
    /// Parsing produced an outcome nothing could handle.
    Rejected,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Triaged => "triaged",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "triaged" => Ok(Self::Triaged),
            "rejected" => Ok(Self::Rejected),
            other => Err(DatabaseError::Serialization(format!(
                "unknown message status '{other}'"
            ))),
        }
    }
}

/// An inbound message to persist.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub external_id: String,
    pub channel: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

/// A persisted inbound message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub external_id: String,
    pub channel: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: Option<String>,
    pub content: String,
    pub received_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound message storage.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message in `pending`. Re-inserting the same external id
    /// returns the existing row's id.
    async fn insert_message(&self, message: &NewMessage) -> Result<String, DatabaseError>;

    /// Get a message by its internal id.
    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Look up a message by its external (channel-native) id.
    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// All messages of a thread, oldest first.
    async fn get_thread_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Update a message's status.
    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<(), DatabaseError>;

    /// Move up to `limit` pending messages to `queued` and return them, oldest first.
    async fn claim_pending_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Move one message from `pending` to `queued`. Returns false if it was
    /// not pending (already claimed by someone else, or settled).
    async fn claim_message(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Move every `queued` message back to `pending`. Run at startup: no
    /// conversation survives a restart, so queued rows have no owner.
    async fn requeue_queued_messages(&self) -> Result<usize, DatabaseError>;
}

/// Storage for event inbox records.
#[async_trait]
pub trait EventInboxRepository: Send + Sync {
    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<EventInboxRecord>, DatabaseError>;

    /// Records with this content hash, most recently updated first.
    async fn find_by_event_hash(&self, hash: &EventHash) -> Result<Vec<EventInboxRecord>, DatabaseError>;

    /// Insert or overwrite the record.
    async fn save(&self, record: &EventInboxRecord) -> Result<(), DatabaseError>;

    /// Atomically take the processing lease for `record`.
    ///
    /// With `previous = None` the record is inserted only if no row with
    /// its message id exists. With `Some(status)` the stored row is
    /// overwritten only while it is still in `status`. Returns whether
    /// this caller won.
    async fn claim(
        &self,
        record: &EventInboxRecord,
        previous: Option<EventStatus>,
    ) -> Result<bool, DatabaseError>;

    /// Delete a record. Returns whether a row was removed.
    async fn delete(&self, message_id: &MessageId) -> Result<bool, DatabaseError>;

    /// Create the index cleanup relies on. Idempotent.
    async fn setup_cleanup_infrastructure(&self) -> Result<(), DatabaseError>;

    /// Whether the table and cleanup index exist.
    async fn is_cleanup_available(&self) -> Result<bool, DatabaseError>;

    /// Delete up to `limit` settled records that expired before `now`.
    async fn delete_expired_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, DatabaseError>;

    /// Delete every eligible record in batches. Returns the total deleted.
    async fn execute_cleanup(&self, config: &CleanupConfig) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let mut total = 0;
        let mut batches = 0u32;
        loop {
            let deleted = self.delete_expired_batch(now, config.batch_size).await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
            batches += 1;
            debug!(batch = batches, deleted, "Inbox cleanup batch");
            tokio::time::sleep(config.batch_pause).await;
        }
        if total > 0 {
            info!(total, batches, "Inbox cleanup finished");
        }
        Ok(total)
    }
}

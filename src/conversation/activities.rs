//! Activities registered by the conversation layer.
//!
//! Each one wraps a store call behind the JSON activity contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::conversation::outcome::{LineItem, ParseOutcome};
use crate::conversation::state::WorkItem;
use crate::durable::activity::Activity;
use crate::error::ActivityError;
use crate::store::traits::{Database, MessageStatus, StoredMessage};

pub const PARSE_THREAD: &str = "parse_thread";
pub const RECORD_TRIAGE: &str = "record_triage";
pub const FETCH_NEW_ITEMS: &str = "fetch_new_items";

/// Extracts requested line items from a message in its thread context.
#[async_trait]
pub trait ThreadParser: Send + Sync {
    /// `thread` holds every stored message of the thread, oldest first,
    /// including `message`.
    async fn parse(&self, thread: &[StoredMessage], message: &StoredMessage) -> anyhow::Result<Vec<LineItem>>;
}

/// Loads a message and its thread, then runs the parser.
pub struct ParseThreadActivity {
    db: Arc<dyn Database>,
    parser: Arc<dyn ThreadParser>,
}

impl ParseThreadActivity {
    pub fn new(db: Arc<dyn Database>, parser: Arc<dyn ThreadParser>) -> Self {
        Self { db, parser }
    }
}

#[async_trait]
impl Activity for ParseThreadActivity {
    fn name(&self) -> &str {
        PARSE_THREAD
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        let item: WorkItem = serde_json::from_value(input)?;

        let message = self.db.get_message(&item.message_id).await?.ok_or_else(|| {
            ActivityError::NonRetryable(format!("message {} not found", item.message_id))
        })?;
        let thread = self.db.get_thread_messages(&item.thread_id).await?;

        let items = self
            .parser
            .parse(&thread, &message)
            .await
            .map_err(|e| ActivityError::Retryable(format!("parser failed: {e:#}")))?;

        let outcome = ParseOutcome::new(item.thread_id, item.message_id, items);
        debug!(
            thread_id = %outcome.thread_id,
            message_id = %outcome.message_id,
            quantity = outcome.quantity,
            thread_len = thread.len(),
            "Thread parsed"
        );
        Ok(serde_json::to_value(outcome)?)
    }
}

/// Input of `record_triage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRecord {
    pub message_id: String,
    pub status: MessageStatus,
}

/// Writes the final status of a parsed message.
pub struct RecordTriageActivity {
    db: Arc<dyn Database>,
}

impl RecordTriageActivity {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Activity for RecordTriageActivity {
    fn name(&self) -> &str {
        RECORD_TRIAGE
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        let record: TriageRecord = serde_json::from_value(input)?;
        self.db
            .update_message_status(&record.message_id, record.status)
            .await?;
        info!(message_id = %record.message_id, status = %record.status, "Message status recorded");
        Ok(json!({ "message_id": record.message_id, "status": record.status }))
    }
}

/// Output of `fetch_new_items`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedItems {
    pub items: Vec<WorkItem>,
    #[serde(default)]
    pub completed_thread_ids: Vec<String>,
}

/// Claims pending messages for the poller.
///
/// The message store has no notion of closed threads, so
/// `completed_thread_ids` is always empty here; completion arrives as
/// inbound `thread_completed` events instead.
pub struct FetchNewItemsActivity {
    db: Arc<dyn Database>,
    batch_limit: usize,
}

impl FetchNewItemsActivity {
    pub fn new(db: Arc<dyn Database>, batch_limit: usize) -> Self {
        Self { db, batch_limit }
    }
}

#[async_trait]
impl Activity for FetchNewItemsActivity {
    fn name(&self) -> &str {
        FETCH_NEW_ITEMS
    }

    async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        let claimed = self.db.claim_pending_messages(self.batch_limit).await?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "Claimed pending messages");
        }
        let fetched = FetchedItems {
            items: claimed
                .into_iter()
                .map(|m| WorkItem::new(m.thread_id, m.id))
                .collect(),
            completed_thread_ids: Vec::new(),
        };
        Ok(serde_json::to_value(fetched)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::store::traits::NewMessage;

    /// One item per message line starting with a digit.
    struct DigitLines;

    #[async_trait]
    impl ThreadParser for DigitLines {
        async fn parse(&self, _thread: &[StoredMessage], message: &StoredMessage) -> anyhow::Result<Vec<LineItem>> {
            Ok(message
                .content
                .lines()
                .filter(|l| l.starts_with(|c: char| c.is_ascii_digit()))
                .map(|l| LineItem {
                    description: l.to_string(),
                    quantity: 1,
                    unit: None,
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl ThreadParser for Broken {
        async fn parse(&self, _: &[StoredMessage], _: &StoredMessage) -> anyhow::Result<Vec<LineItem>> {
            anyhow::bail!("model unavailable")
        }
    }

    fn message(external_id: &str, thread_id: &str, content: &str) -> NewMessage {
        NewMessage {
            external_id: external_id.into(),
            channel: "email".into(),
            thread_id: thread_id.into(),
            sender: "buyer@acme.test".into(),
            subject: Some("RFQ".into()),
            content: content.into(),
            received_at: Utc::now(),
        }
    }

    async fn db() -> Arc<LibSqlBackend> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn parse_thread_builds_outcome() {
        let db = db().await;
        let id = db
            .insert_message(&message("ext-1", "t-1", "1 pallet of M8 bolts\nthanks"))
            .await
            .unwrap();

        let activity = ParseThreadActivity::new(db, Arc::new(DigitLines));
        let out = activity
            .execute(serde_json::to_value(WorkItem::new("t-1", &id)).unwrap())
            .await
            .unwrap();
        let outcome: ParseOutcome = serde_json::from_value(out).unwrap();
        assert_eq!(outcome.quantity, 1);
        assert_eq!(outcome.message_id, id);
        assert_eq!(outcome.thread_id, "t-1");
    }

    #[tokio::test]
    async fn parse_thread_missing_message_is_permanent() {
        let activity = ParseThreadActivity::new(db().await, Arc::new(DigitLines));
        let err = activity
            .execute(json!({"thread_id": "t", "message_id": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::NonRetryable(_)));
    }

    #[tokio::test]
    async fn parser_failure_is_retryable() {
        let db = db().await;
        let id = db.insert_message(&message("ext-1", "t-1", "x")).await.unwrap();
        let activity = ParseThreadActivity::new(db, Arc::new(Broken));
        let err = activity
            .execute(json!({"thread_id": "t-1", "message_id": id}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Retryable(ref m) if m.contains("model unavailable")));
    }

    #[tokio::test]
    async fn record_triage_updates_status() {
        let db = db().await;
        let id = db.insert_message(&message("ext-1", "t-1", "x")).await.unwrap();
        let activity = RecordTriageActivity::new(db.clone());
        activity
            .execute(json!({"message_id": id, "status": "triaged"}))
            .await
            .unwrap();
        let stored = db.get_message(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Triaged);
    }

    #[tokio::test]
    async fn fetch_claims_each_pending_message_once() {
        let db = db().await;
        for i in 0..3 {
            db.insert_message(&message(&format!("ext-{i}"), "t-1", "x"))
                .await
                .unwrap();
        }
        let activity = FetchNewItemsActivity::new(db, 2);

        let first: FetchedItems =
            serde_json::from_value(activity.execute(json!({})).await.unwrap()).unwrap();
        let second: FetchedItems =
            serde_json::from_value(activity.execute(json!({})).await.unwrap()).unwrap();
        let third: FetchedItems =
            serde_json::from_value(activity.execute(json!({})).await.unwrap()).unwrap();

        assert_eq!(first.items.len(), 2);
        assert_eq!(second.items.len(), 1);
        assert!(third.items.is_empty());
        assert!(first.items.iter().all(|i| i.thread_id == "t-1"));
    }
}

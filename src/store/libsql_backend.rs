//! libSQL backend implementing `Database` and `EventInboxRepository`.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inbox::model::{EventHash, EventInboxRecord, EventStatus, MessageId, RecordParts};
use crate::store::migrations::{self, CLEANUP_INDEX};
use crate::store::traits::{
    Database, EventInboxRepository, MessageStatus, NewMessage, StoredMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps TEXT comparison in
/// timestamp order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

/// Map a libsql Row to a StoredMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let received_str: String = row.get(7).map_err(row_err)?;
    let status_str: String = row.get(8).map_err(row_err)?;
    let created_str: String = row.get(9).map_err(row_err)?;
    let updated_str: String = row.get(10).map_err(row_err)?;

    Ok(StoredMessage {
        id: row.get(0).map_err(row_err)?,
        external_id: row.get(1).map_err(row_err)?,
        channel: row.get(2).map_err(row_err)?,
        thread_id: row.get(3).map_err(row_err)?,
        sender: row.get(4).map_err(row_err)?,
        subject: row.get(5).ok(),
        content: row.get(6).map_err(row_err)?,
        received_at: parse_datetime(&received_str),
        status: status_str.parse()?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an EventInboxRecord. Column order matches INBOX_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<EventInboxRecord, DatabaseError> {
    let processed_str: Option<String> = row.get(4).ok();
    let expires_str: String = row.get(5).map_err(row_err)?;
    let metadata_str: String = row.get(6).map_err(row_err)?;
    let attempts: i64 = row.get(7).map_err(row_err)?;
    let created_str: String = row.get(9).map_err(row_err)?;
    let updated_str: String = row.get(10).map_err(row_err)?;

    let metadata = serde_json::from_str(&metadata_str)
        .map_err(|e| DatabaseError::Serialization(format!("inbox metadata: {e}")))?;

    EventInboxRecord::restore(RecordParts {
        message_id: row.get(0).map_err(row_err)?,
        source: row.get(1).map_err(row_err)?,
        event_hash: row.get(2).map_err(row_err)?,
        status: row.get(3).map_err(row_err)?,
        processed_at: parse_optional_datetime(&processed_str),
        expires_at: parse_datetime(&expires_str),
        metadata,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get(8).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
    .map_err(|e| DatabaseError::Serialization(format!("inbox record: {e}")))
}

/// Bind a record's columns in INBOX_COLUMNS order.
fn record_params(record: &EventInboxRecord) -> Result<Vec<libsql::Value>, DatabaseError> {
    let metadata = serde_json::to_string(record.metadata())
        .map_err(|e| DatabaseError::Serialization(format!("inbox metadata: {e}")))?;
    Ok(vec![
        libsql::Value::Text(record.message_id().to_string()),
        libsql::Value::Text(record.source().to_string()),
        libsql::Value::Text(record.event_hash().to_string()),
        libsql::Value::Text(record.status().to_string()),
        opt_text(record.processed_at().map(|t| ts(&t))),
        libsql::Value::Text(ts(&record.expires_at())),
        libsql::Value::Text(metadata),
        libsql::Value::Integer(i64::from(record.attempts())),
        opt_text(record.last_error().map(str::to_string)),
        libsql::Value::Text(ts(&record.created_at())),
        libsql::Value::Text(ts(&record.updated_at())),
    ])
}

async fn collect_messages(mut rows: libsql::Rows) -> Result<Vec<StoredMessage>, DatabaseError> {
    let mut messages = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("read messages: {e}")))?
    {
        match row_to_message(&row) {
            Ok(msg) => messages.push(msg),
            Err(e) => warn!("Skipping message row: {e}"),
        }
    }
    Ok(messages)
}

const MESSAGE_COLUMNS: &str = "id, external_id, channel, thread_id, sender, subject, content, received_at, status, created_at, updated_at";

const INBOX_COLUMNS: &str = "message_id, source, event_hash, status, processed_at, expires_at, metadata, attempts, last_error, created_at, updated_at";

// ── Messages ────────────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = ts(&Utc::now());
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT INTO messages (id, external_id, channel, thread_id, sender, subject, content,
                    received_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id.clone(),
                    message.external_id.clone(),
                    message.channel.clone(),
                    message.thread_id.clone(),
                    message.sender.clone(),
                    opt_text(message.subject.clone()),
                    message.content.clone(),
                    ts(&message.received_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if inserted == 1 {
            debug!(id = %id, external_id = %message.external_id, "Message inserted into DB");
            return Ok(id);
        }

        let existing = self
            .get_message_by_external_id(&message.external_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: message.external_id.clone(),
            })?;
        debug!(id = %existing.id, external_id = %message.external_id, "Message already stored");
        Ok(existing.id)
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;
        Ok(collect_messages(rows).await?.into_iter().next())
    }

    async fn get_message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = ?1"),
                params![external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_by_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_message_by_external_id: {e}"
            ))),
        }
    }

    async fn get_thread_messages(&self, thread_id: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY received_at ASC"
                ),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread_messages: {e}")))?;
        collect_messages(rows).await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<(), DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_status: {e}")))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        debug!(id = id, status = %status, "Message status updated in DB");
        Ok(())
    }

    async fn claim_pending_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE messages SET status = 'queued', updated_at = ?1
                     WHERE id IN (
                         SELECT id FROM messages WHERE status = 'pending'
                         ORDER BY received_at ASC LIMIT ?2
                     )
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                params![ts(&Utc::now()), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_pending_messages: {e}")))?;

        let mut messages = collect_messages(rows).await?;
        messages.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(messages)
    }

    async fn claim_message(&self, id: &str) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'queued', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_message: {e}")))?;
        Ok(updated == 1)
    }

    async fn requeue_queued_messages(&self) -> Result<usize, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE messages SET status = 'pending', updated_at = ?1 WHERE status = 'queued'",
                params![ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_queued_messages: {e}")))?;
        Ok(updated as usize)
    }
}

// ── Event inbox ─────────────────────────────────────────────────────

#[async_trait]
impl EventInboxRepository for LibSqlBackend {
    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<EventInboxRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOX_COLUMNS} FROM event_inbox WHERE message_id = ?1"),
                params![message_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_message_id: {e}"))),
        }
    }

    async fn find_by_event_hash(&self, hash: &EventHash) -> Result<Vec<EventInboxRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOX_COLUMNS} FROM event_inbox WHERE event_hash = ?1 ORDER BY updated_at DESC"
                ),
                params![hash.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_event_hash: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_by_event_hash: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn save(&self, record: &EventInboxRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO event_inbox ({INBOX_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(message_id) DO UPDATE SET
                        source = excluded.source,
                        event_hash = excluded.event_hash,
                        status = excluded.status,
                        processed_at = excluded.processed_at,
                        expires_at = excluded.expires_at,
                        metadata = excluded.metadata,
                        attempts = excluded.attempts,
                        last_error = excluded.last_error,
                        updated_at = excluded.updated_at"
                ),
                record_params(record)?,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save inbox record: {e}")))?;

        debug!(message_id = %record.message_id(), status = %record.status(), "Inbox record saved");
        Ok(())
    }

    async fn claim(
        &self,
        record: &EventInboxRecord,
        previous: Option<EventStatus>,
    ) -> Result<bool, DatabaseError> {
        let mut values = record_params(record)?;
        let affected = match previous {
            None => self
                .conn()
                .execute(
                    &format!(
                        "INSERT INTO event_inbox ({INBOX_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                         ON CONFLICT DO NOTHING"
                    ),
                    values,
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim (insert): {e}")))?,
            Some(expected) => {
                values.push(libsql::Value::Text(expected.to_string()));
                self.conn()
                    .execute(
                        "UPDATE event_inbox SET
                            source = ?2, event_hash = ?3, status = ?4, processed_at = ?5,
                            expires_at = ?6, metadata = ?7, attempts = ?8, last_error = ?9,
                            updated_at = ?11
                         WHERE message_id = ?1 AND status = ?12",
                        values,
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("claim (update): {e}")))?
            }
        };

        let won = affected == 1;
        debug!(message_id = %record.message_id(), won, "Inbox claim");
        Ok(won)
    }

    async fn delete(&self, message_id: &MessageId) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM event_inbox WHERE message_id = ?1",
                params![message_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete inbox record: {e}")))?;
        Ok(deleted > 0)
    }

    async fn setup_cleanup_infrastructure(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS {CLEANUP_INDEX} ON event_inbox(expires_at, status)"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("setup_cleanup_infrastructure: {e}")))?;
        info!("Inbox cleanup infrastructure ready");
        Ok(())
    }

    async fn is_cleanup_available(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        Ok(migrations::schema_object_exists(conn, "table", "event_inbox").await?
            && migrations::schema_object_exists(conn, "index", CLEANUP_INDEX).await?)
    }

    async fn delete_expired_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM event_inbox WHERE rowid IN (
                    SELECT rowid FROM event_inbox
                    WHERE expires_at < ?1
                      AND status IN ('completed', 'failed')
                      AND processed_at IS NOT NULL
                    LIMIT ?2
                 )",
                params![ts(&now), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_expired_batch: {e}")))?;
        Ok(deleted as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

//! Error types for the RFQ intake service.

use std::time::Duration;

use crate::inbox::model::EventStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised by the ingestion guard and the inbox aggregate.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    /// A duplicate delivery arrived while the original is still processing.
    /// Callers must not retry the handler.
    #[error("Event {message_id} is locked: a delivery is already being processed")]
    EventLocked { message_id: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: EventStatus, to: EventStatus },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Handler failed: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

impl InboxError {
    /// Whether the guard may re-run the handler after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::EventLocked { .. }
                | Self::InvalidStatusTransition { .. }
                | Self::InvalidValue { .. }
                | Self::InvalidPayload(_)
        )
    }
}

/// Errors surfaced by the durable workflow runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow {workflow_id} is already running")]
    AlreadyStarted { workflow_id: String },

    #[error("Workflow {workflow_id} not found")]
    NotFound { workflow_id: String },

    #[error("No {kind} registered under name {name}")]
    NotRegistered { kind: &'static str, name: String },

    #[error("Activity {activity} failed after {attempts} attempt(s): {reason}")]
    ActivityFailed {
        activity: String,
        attempts: u32,
        reason: String,
    },

    #[error("Activity {activity} timed out after {timeout:?} ({attempts} attempt(s))")]
    ActivityTimeout {
        activity: String,
        attempts: u32,
        timeout: Duration,
    },

    #[error("Unhandled parse outcome for thread {thread_id}: {outcome}")]
    UnhandledOutcome { thread_id: String, outcome: String },

    #[error("Child workflow {workflow_id} failed after {attempts} attempt(s): {reason}")]
    ChildFailed {
        workflow_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Workflow {workflow_id} was cancelled")]
    Cancelled { workflow_id: String },

    #[error("Workflow failed: {0}")]
    Failed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl WorkflowError {
    /// Cancellation is never a business failure; callers log and re-raise it.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors returned by activity implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActivityError {
    /// Transient failure; the retry policy decides whether to try again.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; remaining attempts are skipped.
    #[error("{0}")]
    NonRetryable(String),
}

impl From<DatabaseError> for ActivityError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } | DatabaseError::Serialization(_) => {
                Self::NonRetryable(e.to_string())
            }
            other => Self::Retryable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(e: serde_json::Error) -> Self {
        Self::NonRetryable(format!("invalid activity payload: {e}"))
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;

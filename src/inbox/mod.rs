//! Event inbox: idempotent ingestion of at-least-once deliveries.

pub mod cleanup;
pub mod guard;
pub mod hash;
pub mod model;

pub use cleanup::{CleanupScheduler, spawn_cleanup_scheduler};
pub use guard::{EventDescriptor, GuardOutcome, IngestionGuard};
pub use model::{EventHash, EventInboxRecord, EventSource, EventStatus, MessageId};

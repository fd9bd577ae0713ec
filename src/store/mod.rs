//! Persistence layer: libSQL-backed storage for messages and the event inbox.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, EventInboxRepository, MessageStatus, NewMessage, StoredMessage};

//! SQLite-backed persistence for the moderation engine.
//!
//! Holds the recipient directory (users and chats), spam-counter rows, and
//! pending notice-deletion jobs. The engine only ever issues idempotent
//! upserts, keyed deletes, counted selects, and paginated ordered scans;
//! everything else lives in memory.

use thiserror::Error;

mod sqlite;
mod writer;

pub use sqlite::{ChatRow, NoticeJobRow, SpamCounterRow, SqliteEngineStore};
pub use writer::{StoreWrite, StoreWriter};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("store worker task failed: {0}")]
    Task(String),
}

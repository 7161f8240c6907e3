//! SQLite store with durable recipient/counter/job persistence.
//!
//! Connections are opened per operation and all rusqlite work runs on the
//! blocking pool so the event loop never stalls on disk I/O.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::{StoreError, StoreResult};

/// Persisted spam-counter state for one `(chat, user)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamCounterRow {
    pub count: u32,
    pub last_violation_unix: u64,
}

/// Persisted chat directory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRow {
    pub chat_id: i64,
    pub is_admin: bool,
}

/// Pending delayed deletion of a notice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoticeJobRow {
    pub chat_id: i64,
    pub message_id: i64,
    pub run_at_unix: u64,
}

/// Persistent SQLite store backend for the engine.
#[derive(Debug, Clone)]
pub struct SqliteEngineStore {
    db_path: PathBuf,
}

impl SqliteEngineStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let connection = open_connection(&store.db_path)?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    async fn with_connection<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path)?;
            op(&mut connection)
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    pub async fn upsert_user(&self, user_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO users (user_id) VALUES (?1) ON CONFLICT DO NOTHING",
                params![user_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_user(&self, user_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute("DELETE FROM users WHERE user_id = ?1", params![user_id])?;
            Ok(())
        })
        .await
    }

    pub async fn count_users(&self) -> StoreResult<u64> {
        self.with_connection(|connection| {
            let count: i64 =
                connection.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Keyset-paginated ordered scan: user ids strictly above `after_id`.
    pub async fn scan_users(&self, after_id: i64, limit: u32) -> StoreResult<Vec<i64>> {
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                "SELECT user_id FROM users WHERE user_id > ?1 ORDER BY user_id LIMIT ?2",
            )?;
            let ids = statement
                .query_map(params![after_id, i64::from(limit)], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
        .await
    }

    /// Registers a chat; an existing row keeps its admin flag.
    pub async fn upsert_chat(&self, chat_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO chats (chat_id, is_admin) VALUES (?1, 0) ON CONFLICT DO NOTHING",
                params![chat_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_chat_admin(&self, chat_id: i64, is_admin: bool) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO chats (chat_id, is_admin) VALUES (?1, ?2)
                 ON CONFLICT(chat_id) DO UPDATE SET is_admin = excluded.is_admin",
                params![chat_id, is_admin as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_chat(&self, chat_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute("DELETE FROM chats WHERE chat_id = ?1", params![chat_id])?;
            Ok(())
        })
        .await
    }

    pub async fn count_chats(&self, admin_only: bool) -> StoreResult<u64> {
        self.with_connection(move |connection| {
            let query = if admin_only {
                "SELECT count(*) FROM chats WHERE is_admin = 1"
            } else {
                "SELECT count(*) FROM chats"
            };
            let count: i64 = connection.query_row(query, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Keyset-paginated ordered scan over chat rows.
    pub async fn scan_chats(
        &self,
        after_id: i64,
        limit: u32,
        admin_only: bool,
    ) -> StoreResult<Vec<ChatRow>> {
        self.with_connection(move |connection| {
            let query = if admin_only {
                "SELECT chat_id, is_admin FROM chats
                 WHERE chat_id > ?1 AND is_admin = 1 ORDER BY chat_id LIMIT ?2"
            } else {
                "SELECT chat_id, is_admin FROM chats
                 WHERE chat_id > ?1 ORDER BY chat_id LIMIT ?2"
            };
            let mut statement = connection.prepare(query)?;
            let rows = statement
                .query_map(params![after_id, i64::from(limit)], |row| {
                    Ok(ChatRow {
                        chat_id: row.get(0)?,
                        is_admin: row.get::<_, i64>(1)? != 0,
                    })
                })?
                .collect::<Result<Vec<ChatRow>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn fetch_spam_counter(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> StoreResult<Option<SpamCounterRow>> {
        self.with_connection(move |connection| {
            let row = connection
                .query_row(
                    "SELECT count, last_time FROM link_spam WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id],
                    |row| {
                        Ok(SpamCounterRow {
                            count: row.get::<_, i64>(0)?.max(0) as u32,
                            last_violation_unix: row.get::<_, i64>(1)?.max(0) as u64,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn upsert_spam_counter(
        &self,
        chat_id: i64,
        user_id: i64,
        row: SpamCounterRow,
    ) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO link_spam (chat_id, user_id, count, last_time)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_id, user_id) DO UPDATE
                 SET count = excluded.count, last_time = excluded.last_time",
                params![
                    chat_id,
                    user_id,
                    i64::from(row.count),
                    row.last_violation_unix as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn clear_spam_counter(&self, chat_id: i64, user_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "DELETE FROM link_spam WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn insert_notice_job(&self, job: NoticeJobRow) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO notice_jobs (chat_id, message_id, run_at)
                 VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
                params![job.chat_id, job.message_id, job.run_at_unix as i64],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_notice_job(&self, chat_id: i64, message_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                "DELETE FROM notice_jobs WHERE chat_id = ?1 AND message_id = ?2",
                params![chat_id, message_id],
            )?;
            Ok(())
        })
        .await
    }

    /// All pending notice jobs, oldest first; used to re-arm after restart.
    pub async fn list_notice_jobs(&self) -> StoreResult<Vec<NoticeJobRow>> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare(
                "SELECT chat_id, message_id, run_at FROM notice_jobs ORDER BY run_at",
            )?;
            let jobs = statement
                .query_map([], |row| {
                    Ok(NoticeJobRow {
                        chat_id: row.get(0)?,
                        message_id: row.get(1)?,
                        run_at_unix: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                })?
                .collect::<Result<Vec<NoticeJobRow>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    /// Rewrites every row keyed by `old_chat_id` to `new_chat_id` in one
    /// transaction. Rows already present under the new id win.
    pub async fn migrate_chat(&self, old_chat_id: i64, new_chat_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            let transaction = connection.transaction()?;
            transaction.execute(
                "INSERT INTO chats (chat_id, is_admin)
                 SELECT ?2, is_admin FROM chats WHERE chat_id = ?1
                 ON CONFLICT DO NOTHING",
                params![old_chat_id, new_chat_id],
            )?;
            transaction.execute("DELETE FROM chats WHERE chat_id = ?1", params![old_chat_id])?;
            transaction.execute(
                "UPDATE OR REPLACE link_spam SET chat_id = ?2 WHERE chat_id = ?1",
                params![old_chat_id, new_chat_id],
            )?;
            transaction.execute(
                "UPDATE OR REPLACE notice_jobs SET chat_id = ?2 WHERE chat_id = ?1",
                params![old_chat_id, new_chat_id],
            )?;
            transaction.commit()?;
            Ok(())
        })
        .await
    }

    /// Removes every row referencing an unreachable chat.
    pub async fn purge_chat(&self, chat_id: i64) -> StoreResult<()> {
        self.with_connection(move |connection| {
            let transaction = connection.transaction()?;
            transaction.execute("DELETE FROM chats WHERE chat_id = ?1", params![chat_id])?;
            transaction.execute("DELETE FROM link_spam WHERE chat_id = ?1", params![chat_id])?;
            transaction.execute(
                "DELETE FROM notice_jobs WHERE chat_id = ?1",
                params![chat_id],
            )?;
            transaction.commit()?;
            Ok(())
        })
        .await
    }
}

fn open_connection(db_path: &Path) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS chats (
            chat_id INTEGER PRIMARY KEY,
            is_admin INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS link_spam (
            chat_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            count INTEGER NOT NULL,
            last_time INTEGER NOT NULL,
            PRIMARY KEY (chat_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS notice_jobs (
            chat_id INTEGER NOT NULL,
            message_id INTEGER NOT NULL,
            run_at INTEGER NOT NULL,
            PRIMARY KEY (chat_id, message_id)
        );
        "#,
    )?;
    Ok(())
}

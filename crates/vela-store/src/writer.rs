//! Fire-and-forget persistence queue.
//!
//! Decision paths (message deletion, user notices) never await store writes;
//! they enqueue a command here and move on. A single writer task drains the
//! bounded queue, logging and swallowing failures. In-memory state is the
//! fast path of record, so a dropped or reordered write is acceptable
//! (last-write-wins on the persisted row).

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::sqlite::{NoticeJobRow, SpamCounterRow, SqliteEngineStore};

const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;

/// One deferred store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    UpsertUser {
        user_id: i64,
    },
    DeleteUser {
        user_id: i64,
    },
    UpsertChat {
        chat_id: i64,
    },
    SetChatAdmin {
        chat_id: i64,
        is_admin: bool,
    },
    DeleteChat {
        chat_id: i64,
    },
    UpsertSpamCounter {
        chat_id: i64,
        user_id: i64,
        row: SpamCounterRow,
    },
    ClearSpamCounter {
        chat_id: i64,
        user_id: i64,
    },
    InsertNoticeJob {
        job: NoticeJobRow,
    },
    DeleteNoticeJob {
        chat_id: i64,
        message_id: i64,
    },
}

enum WriterCommand {
    Write(StoreWrite),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle for enqueueing deferred writes.
#[derive(Debug, Clone)]
pub struct StoreWriter {
    sender: mpsc::Sender<WriterCommand>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write(write) => write!(f, "Write({write:?})"),
            Self::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl StoreWriter {
    /// Spawns the drain task over `store` and returns the enqueue handle.
    pub fn spawn(store: SqliteEngineStore) -> (Self, JoinHandle<()>) {
        Self::spawn_with_capacity(store, DEFAULT_WRITE_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        store: SqliteEngineStore,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<WriterCommand>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    WriterCommand::Write(write) => {
                        if let Err(error) = apply_write(&store, &write).await {
                            warn!(?write, %error, "background store write failed");
                        }
                    }
                    WriterCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { sender }, handle)
    }

    /// Enqueues without waiting. A full or closed queue drops the write with
    /// a warning; callers must never block on persistence.
    pub fn enqueue(&self, write: StoreWrite) {
        if let Err(error) = self.sender.try_send(WriterCommand::Write(write)) {
            warn!(%error, "store write queue rejected entry");
        }
    }

    /// Waits until every write enqueued before this call has been applied.
    /// Used at shutdown and in tests; never on the decision path.
    pub async fn flush(&self) {
        let (done, signal) = oneshot::channel();
        if self.sender.send(WriterCommand::Flush(done)).await.is_ok() {
            let _ = signal.await;
        }
    }
}

async fn apply_write(store: &SqliteEngineStore, write: &StoreWrite) -> crate::StoreResult<()> {
    match *write {
        StoreWrite::UpsertUser { user_id } => store.upsert_user(user_id).await,
        StoreWrite::DeleteUser { user_id } => store.delete_user(user_id).await,
        StoreWrite::UpsertChat { chat_id } => store.upsert_chat(chat_id).await,
        StoreWrite::SetChatAdmin { chat_id, is_admin } => {
            store.set_chat_admin(chat_id, is_admin).await
        }
        StoreWrite::DeleteChat { chat_id } => store.delete_chat(chat_id).await,
        StoreWrite::UpsertSpamCounter {
            chat_id,
            user_id,
            row,
        } => store.upsert_spam_counter(chat_id, user_id, row).await,
        StoreWrite::ClearSpamCounter { chat_id, user_id } => {
            store.clear_spam_counter(chat_id, user_id).await
        }
        StoreWrite::InsertNoticeJob { job } => store.insert_notice_job(job).await,
        StoreWrite::DeleteNoticeJob {
            chat_id,
            message_id,
        } => store.delete_notice_job(chat_id, message_id).await,
    }
}

//! Delayed, named, cancellable jobs without a central poller.
//!
//! Each scheduled job is one sleeping tokio task that posts its payload back
//! onto the engine's event channel at fire time. Jobs are keyed so a chat's
//! whole set can be cancelled atomically, and rekeyed in place when a chat's
//! identity migrates. The executing side re-checks live state before acting,
//! so a job that slips through a cancellation race has no stale consequence.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use vela_core::current_unix_timestamp;

/// Job families the engine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    AdminReminder,
    AutoLeave,
    GraceRecheck,
    NoticeDelete,
}

impl JobKind {
    /// Returns the stable snake_case representation used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminReminder => "admin_reminder",
            Self::AutoLeave => "auto_leave",
            Self::GraceRecheck => "grace_recheck",
            Self::NoticeDelete => "notice_delete",
        }
    }
}

/// Unique job identity. `discriminator` separates jobs of the same kind in
/// one chat: the sequence index for reminders, the message id for notice
/// deletions, zero otherwise (which also enforces at most one active
/// auto-leave per chat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub chat_id: i64,
    pub kind: JobKind,
    pub discriminator: i64,
}

impl JobKey {
    pub fn new(chat_id: i64, kind: JobKind, discriminator: i64) -> Self {
        Self {
            chat_id,
            kind,
            discriminator,
        }
    }
}

/// Payload delivered back to the event loop at fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPayload {
    AdminReminder {
        chat_id: i64,
        sequence: u32,
        total: u32,
    },
    AutoLeave {
        chat_id: i64,
    },
    GraceRecheck {
        chat_id: i64,
    },
    NoticeDelete {
        chat_id: i64,
        message_id: i64,
    },
}

impl JobPayload {
    pub fn chat_id(&self) -> i64 {
        match *self {
            Self::AdminReminder { chat_id, .. }
            | Self::AutoLeave { chat_id }
            | Self::GraceRecheck { chat_id }
            | Self::NoticeDelete { chat_id, .. } => chat_id,
        }
    }

    fn with_chat_id(self, chat_id: i64) -> Self {
        match self {
            Self::AdminReminder {
                sequence, total, ..
            } => Self::AdminReminder {
                chat_id,
                sequence,
                total,
            },
            Self::AutoLeave { .. } => Self::AutoLeave { chat_id },
            Self::GraceRecheck { .. } => Self::GraceRecheck { chat_id },
            Self::NoticeDelete { message_id, .. } => Self::NoticeDelete {
                chat_id,
                message_id,
            },
        }
    }
}

struct ScheduledJob {
    handle: JoinHandle<()>,
    payload: JobPayload,
    run_at_unix: u64,
}

/// Keyed delayed-job scheduler.
pub struct ReminderScheduler {
    fired: mpsc::Sender<JobPayload>,
    jobs: Mutex<HashMap<JobKey, ScheduledJob>>,
}

impl ReminderScheduler {
    pub fn new(fired: mpsc::Sender<JobPayload>) -> Self {
        Self {
            fired,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues one job, replacing any pending job under the same key.
    pub fn schedule(&self, key: JobKey, delay: Duration, payload: JobPayload) {
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(payload).await;
        });
        let run_at_unix = current_unix_timestamp().saturating_add(delay.as_secs());
        let mut jobs = lock_unpoisoned(&self.jobs);
        jobs.retain(|_, job| !job.handle.is_finished());
        if let Some(previous) = jobs.insert(
            key,
            ScheduledJob {
                handle,
                payload,
                run_at_unix,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Cancels one job by key; returns whether it was pending.
    pub fn cancel(&self, key: &JobKey) -> bool {
        match lock_unpoisoned(&self.jobs).remove(key) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Atomically removes every pending job that references `chat_id`,
    /// regardless of kind.
    pub fn cancel_all(&self, chat_id: i64) {
        let mut jobs = lock_unpoisoned(&self.jobs);
        let keys: Vec<JobKey> = jobs
            .keys()
            .filter(|key| key.chat_id == chat_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(job) = jobs.remove(&key) {
                job.handle.abort();
            }
        }
        debug!(chat_id, "cancelled pending jobs for chat");
    }

    /// Rekeys a chat's pending jobs to a migrated identity, preserving each
    /// job's remaining delay.
    pub fn migrate_chat(&self, old_chat_id: i64, new_chat_id: i64) {
        let moved: Vec<(JobKey, JobPayload, u64)> = {
            let mut jobs = lock_unpoisoned(&self.jobs);
            let keys: Vec<JobKey> = jobs
                .keys()
                .filter(|key| key.chat_id == old_chat_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    jobs.remove(&key).map(|job| {
                        job.handle.abort();
                        (key, job.payload, job.run_at_unix)
                    })
                })
                .collect()
        };
        let now = current_unix_timestamp();
        for (key, payload, run_at_unix) in moved {
            let key = JobKey::new(new_chat_id, key.kind, key.discriminator);
            let delay = Duration::from_secs(run_at_unix.saturating_sub(now));
            self.schedule(key, delay, payload.with_chat_id(new_chat_id));
        }
    }

    /// Number of still-pending jobs, for diagnostics and tests.
    pub fn pending_jobs(&self) -> usize {
        let mut jobs = lock_unpoisoned(&self.jobs);
        jobs.retain(|_, job| !job.handle.is_finished());
        jobs.len()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

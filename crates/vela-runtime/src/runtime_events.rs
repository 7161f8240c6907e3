//! Single event-processing loop.
//!
//! One poller task long-polls the platform and one forwarder drains fired
//! scheduler jobs; both feed the same channel so all shared-state mutation
//! happens on the loop task in arrival order. Platform and store calls
//! suspend instead of blocking, and nothing holds a lock across an await.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vela_core::current_unix_timestamp;
use vela_moderation::{ModerationOutcome, ModerationPipeline, PermissionCache};
use vela_store::SqliteEngineStore;
use vela_telegram::{Message, TelegramClient, Update};

use crate::runtime_commands::CommandRouter;
use crate::runtime_membership::MembershipCoordinator;
use crate::runtime_scheduler::{JobKey, JobKind, JobPayload, ReminderScheduler};

const DEFAULT_POLL_TIMEOUT_SECS: u64 = 25;
const DEFAULT_POLL_RETRY_DELAY_SECS: u64 = 3;
const DEFAULT_NOTICE_TTL_SECS: u64 = 10_800;
const EVENT_CHANNEL_CAPACITY: usize = 128;
const STARTUP_SWEEP_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Long-poll window passed to `getUpdates`.
    pub poll_timeout_secs: u64,
    /// Pause before re-polling after a failed poll.
    pub poll_retry_delay_secs: u64,
    /// Lifetime of moderation warning notices before deletion.
    pub notice_ttl_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            poll_retry_delay_secs: DEFAULT_POLL_RETRY_DELAY_SECS,
            notice_ttl_secs: DEFAULT_NOTICE_TTL_SECS,
        }
    }
}

/// Everything the loop task processes, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    Update(Box<Update>),
    Job(JobPayload),
}

pub struct EngineRuntime {
    client: Arc<TelegramClient>,
    store: Arc<SqliteEngineStore>,
    permissions: Arc<PermissionCache>,
    pipeline: Arc<ModerationPipeline>,
    membership: Arc<MembershipCoordinator>,
    commands: Arc<CommandRouter>,
    scheduler: Arc<ReminderScheduler>,
    config: RuntimeConfig,
}

impl EngineRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<SqliteEngineStore>,
        permissions: Arc<PermissionCache>,
        pipeline: Arc<ModerationPipeline>,
        membership: Arc<MembershipCoordinator>,
        commands: Arc<CommandRouter>,
        scheduler: Arc<ReminderScheduler>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            client,
            store,
            permissions,
            pipeline,
            membership,
            commands,
            scheduler,
            config,
        }
    }

    /// Warms the authority cache across the known chat directory and
    /// re-arms persisted notice-deletion jobs. Run once before polling.
    pub async fn startup_reconcile(&self) {
        let mut verified = 0_u64;
        let mut admins = 0_u64;
        let mut after_id = i64::MIN;
        loop {
            let page = match self
                .store
                .scan_chats(after_id, STARTUP_SWEEP_PAGE_SIZE, false)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    warn!(%error, "startup chat sweep failed");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            after_id = page[page.len() - 1].chat_id;
            for row in page {
                let authorization = self.permissions.is_bot_authorized(row.chat_id).await;
                verified += 1;
                if authorization.authorized {
                    admins += 1;
                }
            }
        }
        info!(verified, admins, "authority cache warmed");

        match self.store.list_notice_jobs().await {
            Ok(jobs) => {
                let now = current_unix_timestamp();
                let restored = jobs.len();
                for job in jobs {
                    self.scheduler.schedule(
                        JobKey::new(job.chat_id, JobKind::NoticeDelete, job.message_id),
                        Duration::from_secs(job.run_at_unix.saturating_sub(now)),
                        JobPayload::NoticeDelete {
                            chat_id: job.chat_id,
                            message_id: job.message_id,
                        },
                    );
                }
                info!(restored, "notice-deletion jobs re-armed");
            }
            Err(error) => warn!(%error, "notice-job restore failed"),
        }
    }

    /// Runs the loop until the process is stopped.
    pub async fn run(self: Arc<Self>, mut fired_jobs: mpsc::Receiver<JobPayload>) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(EVENT_CHANNEL_CAPACITY);

        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(payload) = fired_jobs.recv().await {
                if forward_tx.send(EngineEvent::Job(payload)).await.is_err() {
                    break;
                }
            }
        });

        let poller = Arc::clone(&self);
        tokio::spawn(async move {
            poller.poll_updates(event_tx).await;
        });

        while let Some(event) = event_rx.recv().await {
            self.dispatch(event).await;
        }
        Ok(())
    }

    async fn poll_updates(&self, events: mpsc::Sender<EngineEvent>) {
        let mut offset = 0_i64;
        loop {
            match self
                .client
                .get_updates(offset, self.config.poll_timeout_secs)
                .await
            {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id.saturating_add(1));
                        if events.send(EngineEvent::Update(Box::new(update))).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "update poll failed");
                    tokio::time::sleep(Duration::from_secs(self.config.poll_retry_delay_secs))
                        .await;
                }
            }
        }
    }

    /// Processes one event. Public so end-to-end tests can drive the engine
    /// without the network poller.
    pub async fn dispatch(&self, event: EngineEvent) {
        match event {
            EngineEvent::Job(payload) => self.membership.run_job(payload).await,
            EngineEvent::Update(update) => {
                if let Some(membership) = &update.my_chat_member {
                    self.membership.handle_membership_update(membership).await;
                }
                if let Some(query) = &update.callback_query {
                    self.commands.handle_callback(query).await;
                }
                if let Some(message) = &update.message {
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: &Message) {
        let is_command = message
            .text_or_caption()
            .is_some_and(|text| text.starts_with('/'));
        if is_command {
            self.commands.handle_command(message).await;
            return;
        }

        match self.pipeline.handle_message(message).await {
            ModerationOutcome::Removed {
                chat_id,
                muted,
                notice_message_id,
            } => {
                if let Some(message_id) = notice_message_id {
                    self.membership.schedule_notice_delete(
                        chat_id,
                        message_id,
                        self.config.notice_ttl_secs,
                        true,
                    );
                }
                info!(chat_id, muted, "removed a link message");
            }
            ModerationOutcome::Skipped(reason) => {
                debug!(?reason, chat_id = message.chat.id, "message left alone");
            }
        }
    }
}

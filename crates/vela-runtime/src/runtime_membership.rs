//! Bot membership lifecycle.
//!
//! Drives the state machine over the bot's own membership transitions:
//! welcome on promotion, a bounded reminder sequence plus auto-leave when
//! added without rights, and a grace-period re-verification on demotion or
//! removal so an accidental demotion that is quickly reverted has no
//! consequence. Every scheduled action re-checks live authority at fire
//! time before doing anything.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use vela_core::current_unix_timestamp;
use vela_moderation::PermissionCache;
use vela_store::{NoticeJobRow, StoreWrite, StoreWriter};
use vela_telegram::{
    ChatMemberUpdated, InlineKeyboardButton, InlineKeyboardMarkup, MemberStatus, TelegramClient,
};

use crate::runtime_scheduler::{JobKey, JobKind, JobPayload, ReminderScheduler};

const DEFAULT_REMINDER_COUNT: u32 = 5;
const DEFAULT_REMINDER_INTERVAL_SECS: u64 = 300;
const DEFAULT_GRACE_PERIOD_SECS: u64 = 60;
const DEFAULT_WELCOME_TTL_SECS: u64 = 300;
const AUTO_LEAVE_EXTRA_DELAY_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct ReminderPolicy {
    /// Reminders sent before giving up on an admin-less chat.
    pub reminder_count: u32,
    /// Interval between reminders (and before the first one).
    pub reminder_interval_secs: u64,
    /// Wait after a demotion/removal before re-checking and leaving.
    pub grace_period_secs: u64,
    /// Lifetime of the welcome notice before it is deleted.
    pub welcome_ttl_secs: u64,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        Self {
            reminder_count: DEFAULT_REMINDER_COUNT,
            reminder_interval_secs: DEFAULT_REMINDER_INTERVAL_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            welcome_ttl_secs: DEFAULT_WELCOME_TTL_SECS,
        }
    }
}

pub struct MembershipCoordinator {
    client: Arc<TelegramClient>,
    permissions: Arc<PermissionCache>,
    scheduler: Arc<ReminderScheduler>,
    writer: StoreWriter,
    policy: ReminderPolicy,
    bot_id: i64,
    bot_username: Option<String>,
}

impl MembershipCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<TelegramClient>,
        permissions: Arc<PermissionCache>,
        scheduler: Arc<ReminderScheduler>,
        writer: StoreWriter,
        policy: ReminderPolicy,
        bot_id: i64,
        bot_username: Option<String>,
    ) -> Self {
        Self {
            client,
            permissions,
            scheduler,
            writer,
            policy,
            bot_id,
            bot_username,
        }
    }

    /// Routes one `my_chat_member` transition through the state machine.
    pub async fn handle_membership_update(&self, update: &ChatMemberUpdated) {
        let chat_id = update.chat.id;
        let subject_is_bot = update.new_chat_member.user.id == self.bot_id;
        self.permissions.on_membership_changed(
            chat_id,
            subject_is_bot,
            update.new_chat_member.status,
        );
        if !subject_is_bot {
            return;
        }

        let old = update.old_chat_member.status;
        let new = update.new_chat_member.status;
        info!(
            chat_id,
            old = old.as_str(),
            new = new.as_str(),
            "bot membership changed"
        );

        if new.is_admin() && !old.is_admin() {
            self.on_promoted(chat_id).await;
        } else if !new.is_present() || (old.is_admin() && new == MemberStatus::Member) {
            self.on_rights_lost(chat_id);
        } else if new == MemberStatus::Member && !old.is_present() {
            self.on_added_without_rights(chat_id).await;
        }
    }

    async fn on_promoted(&self, chat_id: i64) {
        self.scheduler.cancel_all(chat_id);
        let text = "✅ <b>Thank you!</b>\n\n\
                    Vela now has admin rights in this group.\n\
                    Automatic link removal and spam muting are active.";
        match self.client.send_html_message(chat_id, text, None).await {
            Ok(sent) => {
                self.schedule_notice_delete(
                    chat_id,
                    sent.message_id,
                    self.policy.welcome_ttl_secs,
                    false,
                );
            }
            Err(error) => warn!(chat_id, %error, "welcome notice send failed"),
        }
    }

    async fn on_added_without_rights(&self, chat_id: i64) {
        self.scheduler.cancel_all(chat_id);
        let text = "⚠️ <b>Admin rights required</b>\n\n\
                    Vela needs admin rights (delete messages) to moderate\n\
                    this group. Please promote the bot.";
        if let Err(error) = self
            .client
            .send_html_message(chat_id, text, self.admin_keyboard().as_ref())
            .await
        {
            warn!(chat_id, %error, "admin-request notice send failed");
        }

        let interval = self.policy.reminder_interval_secs;
        for sequence in 1..=self.policy.reminder_count {
            self.scheduler.schedule(
                JobKey::new(chat_id, JobKind::AdminReminder, i64::from(sequence)),
                Duration::from_secs(interval.saturating_mul(u64::from(sequence))),
                JobPayload::AdminReminder {
                    chat_id,
                    sequence,
                    total: self.policy.reminder_count,
                },
            );
        }
        self.scheduler.schedule(
            JobKey::new(chat_id, JobKind::AutoLeave, 0),
            Duration::from_secs(
                interval
                    .saturating_mul(u64::from(self.policy.reminder_count))
                    .saturating_add(AUTO_LEAVE_EXTRA_DELAY_SECS),
            ),
            JobPayload::AutoLeave { chat_id },
        );
    }

    fn on_rights_lost(&self, chat_id: i64) {
        self.scheduler.cancel_all(chat_id);
        self.scheduler.schedule(
            JobKey::new(chat_id, JobKind::GraceRecheck, 0),
            Duration::from_secs(self.policy.grace_period_secs),
            JobPayload::GraceRecheck { chat_id },
        );
    }

    /// Executes one fired job. Every branch re-checks live state first so a
    /// job that outlived its cause is a no-op.
    pub async fn run_job(&self, payload: JobPayload) {
        match payload {
            JobPayload::AdminReminder {
                chat_id,
                sequence,
                total,
            } => self.run_admin_reminder(chat_id, sequence, total).await,
            JobPayload::AutoLeave { chat_id } | JobPayload::GraceRecheck { chat_id } => {
                self.leave_if_unauthorized(chat_id).await
            }
            JobPayload::NoticeDelete {
                chat_id,
                message_id,
            } => {
                if let Err(error) = self.client.delete_message(chat_id, message_id).await {
                    debug!(chat_id, message_id, %error, "notice delete failed");
                }
                self.writer.enqueue(StoreWrite::DeleteNoticeJob {
                    chat_id,
                    message_id,
                });
            }
        }
    }

    async fn run_admin_reminder(&self, chat_id: i64, sequence: u32, total: u32) {
        self.permissions.invalidate_chat(chat_id);
        let authorization = self.permissions.is_bot_authorized(chat_id).await;
        if authorization.authorized {
            // Promotion observed outside the membership event stream: stop
            // the remaining sequence.
            self.scheduler.cancel_all(chat_id);
            if authorization.chat_id != chat_id {
                self.scheduler.cancel_all(authorization.chat_id);
            }
            return;
        }
        let text = format!(
            "⏰ <b>Reminder ({sequence}/{total})</b>\n\n\
             Vela still needs admin rights (delete messages)\n\
             to moderate this group."
        );
        if let Err(error) = self
            .client
            .send_html_message(authorization.chat_id, &text, self.admin_keyboard().as_ref())
            .await
        {
            warn!(chat_id, %error, "reminder send failed");
        }
    }

    async fn leave_if_unauthorized(&self, chat_id: i64) {
        self.permissions.invalidate_chat(chat_id);
        let authorization = self.permissions.is_bot_authorized(chat_id).await;
        if authorization.authorized {
            debug!(chat_id, "authority restored within grace period");
            return;
        }
        let chat_id = authorization.chat_id;
        info!(chat_id, "leaving chat without admin rights");
        if let Err(error) = self.client.leave_chat(chat_id).await {
            debug!(chat_id, %error, "leave failed");
        }
        self.permissions.purge(chat_id).await;
    }

    /// Schedules the delayed deletion of a notice message; moderation
    /// warnings are persisted so a restart re-arms them.
    pub fn schedule_notice_delete(
        &self,
        chat_id: i64,
        message_id: i64,
        ttl_secs: u64,
        persist: bool,
    ) {
        self.scheduler.schedule(
            JobKey::new(chat_id, JobKind::NoticeDelete, message_id),
            Duration::from_secs(ttl_secs),
            JobPayload::NoticeDelete {
                chat_id,
                message_id,
            },
        );
        if persist {
            self.writer.enqueue(StoreWrite::InsertNoticeJob {
                job: NoticeJobRow {
                    chat_id,
                    message_id,
                    run_at_unix: current_unix_timestamp().saturating_add(ttl_secs),
                },
            });
        }
    }

    fn admin_keyboard(&self) -> Option<InlineKeyboardMarkup> {
        self.bot_username.as_ref().map(|username| {
            InlineKeyboardMarkup::single_row(vec![InlineKeyboardButton::link(
                "⭐️ Grant admin access",
                format!("https://t.me/{username}?startgroup=true"),
            )])
        })
    }
}

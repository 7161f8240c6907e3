//! Per-message moderation state machine.
//!
//! Order matters: the pure link predicate runs before any external call, the
//! authorization and bypass checks run before deletion, and escalation runs
//! only after the message is actually gone. Exactly one notice is sent per
//! removed message: the removal warning or the mute announcement, never
//! both.

use std::sync::Arc;

use tracing::{debug, warn};

use vela_telegram::{Message, TelegramClient};

use crate::moderation_link_filter::detect_link;
use crate::moderation_permission_cache::PermissionCache;
use crate::moderation_spam::{SpamLedger, SpamVerdict};

#[derive(Debug, Clone, Copy)]
pub struct ModerationPolicy {
    /// Messages from this user are never moderated.
    pub exempt_user_id: Option<i64>,
}

/// Why a message was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotGroup,
    NoAuthor,
    Exempt,
    Command,
    NoLink,
    Unauthorized,
    AuthorAdmin,
    AuthorUnverified,
    DeleteFailed,
}

/// Outcome of one message pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationOutcome {
    Skipped(SkipReason),
    /// The message was deleted. `chat_id` is the possibly-migrated identity
    /// the notice lives in; `notice_message_id` is set when the single
    /// follow-up notice went out.
    Removed {
        chat_id: i64,
        muted: bool,
        notice_message_id: Option<i64>,
    },
}

pub struct ModerationPipeline {
    client: Arc<TelegramClient>,
    permissions: Arc<PermissionCache>,
    spam: Arc<SpamLedger>,
    policy: ModerationPolicy,
}

impl ModerationPipeline {
    pub fn new(
        client: Arc<TelegramClient>,
        permissions: Arc<PermissionCache>,
        spam: Arc<SpamLedger>,
        policy: ModerationPolicy,
    ) -> Self {
        Self {
            client,
            permissions,
            spam,
            policy,
        }
    }

    /// Runs the detect → authorize → bypass → delete → escalate pipeline.
    /// Failures short-circuit this message only; nothing here can take the
    /// process down.
    pub async fn handle_message(&self, message: &Message) -> ModerationOutcome {
        if !message.chat.kind.is_group() {
            return ModerationOutcome::Skipped(SkipReason::NotGroup);
        }
        let author = match &message.from {
            Some(author) => author,
            None => return ModerationOutcome::Skipped(SkipReason::NoAuthor),
        };
        if Some(author.id) == self.policy.exempt_user_id {
            return ModerationOutcome::Skipped(SkipReason::Exempt);
        }
        if message
            .text
            .as_deref()
            .is_some_and(|text| text.starts_with('/'))
        {
            return ModerationOutcome::Skipped(SkipReason::Command);
        }
        if !detect_link(message) {
            return ModerationOutcome::Skipped(SkipReason::NoLink);
        }

        let authorization = self.permissions.is_bot_authorized(message.chat.id).await;
        if !authorization.authorized {
            return ModerationOutcome::Skipped(SkipReason::Unauthorized);
        }
        let chat_id = authorization.chat_id;

        match self.permissions.is_user_admin(chat_id, author.id).await {
            Ok(true) => return ModerationOutcome::Skipped(SkipReason::AuthorAdmin),
            Ok(false) => {}
            Err(error) => {
                debug!(chat_id, author = author.id, %error, "author check failed");
                return ModerationOutcome::Skipped(SkipReason::AuthorUnverified);
            }
        }

        if let Err(error) = self.client.delete_message(chat_id, message.message_id).await {
            // The side effect "message removed" did not occur, so the
            // violation is not counted.
            debug!(chat_id, message_id = message.message_id, %error, "delete failed");
            return ModerationOutcome::Skipped(SkipReason::DeleteFailed);
        }

        let verdict = self
            .spam
            .record_violation(chat_id, author.id, message.chat.kind)
            .await;

        // Exactly one notice per removed message, and none at all while a
        // mute window is already open.
        let notice = match verdict {
            SpamVerdict::Counted { .. } => Some(removal_notice(&author.first_name)),
            SpamVerdict::MutedNow => Some(mute_notice(
                &author.first_name,
                self.spam.policy().violation_threshold,
                self.spam.policy().mute_secs,
            )),
            SpamVerdict::AlreadyMuted => None,
        };
        let notice_message_id = match notice {
            Some(text) => match self.client.send_message(chat_id, &text).await {
                Ok(sent) => Some(sent.message_id),
                Err(error) => {
                    warn!(chat_id, %error, "moderation notice send failed");
                    None
                }
            },
            None => None,
        };

        ModerationOutcome::Removed {
            chat_id,
            muted: verdict.muted(),
            notice_message_id,
        }
    }
}

fn removal_notice(first_name: &str) -> String {
    format!("⚠️ {first_name}, your message was removed.\nReason: links are not allowed here.")
}

fn mute_notice(first_name: &str, threshold: u32, mute_secs: u64) -> String {
    format!(
        "🔇 {first_name} has been muted for {} minutes after posting links {threshold} times.",
        mute_secs / 60
    )
}

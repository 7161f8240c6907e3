//! Owner/admin command surface.
//!
//! Thin entry points over the core services: `/start` registration and
//! introduction, `/stats` directory counts, `/refresh` and `/refresh_all`
//! forced re-verification, and the `/broadcast` draft → confirm/cancel flow
//! driven through inline-keyboard callbacks.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vela_broadcast::{BroadcastContent, BroadcastDispatcher, TargetSelector};
use vela_core::{current_unix_timestamp, format_uptime};
use vela_moderation::PermissionCache;
use vela_store::{SqliteEngineStore, StoreWrite, StoreWriter};
use vela_telegram::{
    CallbackQuery, ChatKind, InlineKeyboardButton, InlineKeyboardMarkup, Message, TelegramClient,
};

const CALLBACK_BROADCAST_CANCEL: &str = "broadcast_cancel";
const CALLBACK_BROADCAST_CONFIRM_PREFIX: &str = "broadcast_confirm:";
const REFRESH_SWEEP_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub owner_id: i64,
    /// Image shown with the private-chat introduction; plain text when
    /// unset.
    pub start_image_url: Option<String>,
    pub bot_username: Option<String>,
}

pub struct CommandRouter {
    client: Arc<TelegramClient>,
    store: Arc<SqliteEngineStore>,
    permissions: Arc<PermissionCache>,
    broadcast: Arc<BroadcastDispatcher>,
    writer: StoreWriter,
    config: CommandConfig,
    started_unix: u64,
}

impl CommandRouter {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<SqliteEngineStore>,
        permissions: Arc<PermissionCache>,
        broadcast: Arc<BroadcastDispatcher>,
        writer: StoreWriter,
        config: CommandConfig,
    ) -> Self {
        Self {
            client,
            store,
            permissions,
            broadcast,
            writer,
            config,
            started_unix: current_unix_timestamp(),
        }
    }

    /// Dispatches one command message. Unknown commands are ignored.
    pub async fn handle_command(&self, message: &Message) {
        let Some(author) = &message.from else {
            return;
        };
        let Some(command) = command_token(message) else {
            return;
        };
        match command.as_str() {
            "/start" => {
                if message.chat.kind == ChatKind::Private {
                    self.cmd_start(message).await;
                }
            }
            "/stats" => {
                if message.chat.kind == ChatKind::Private && author.id == self.config.owner_id {
                    self.cmd_stats(message).await;
                }
            }
            "/refresh" => {
                if message.chat.kind.is_group() {
                    self.cmd_refresh(message).await;
                }
            }
            "/refresh_all" => {
                if author.id == self.config.owner_id {
                    self.cmd_refresh_all(message).await;
                }
            }
            "/broadcast" => {
                if author.id == self.config.owner_id {
                    self.cmd_broadcast(message).await;
                }
            }
            _ => {}
        }
    }

    async fn cmd_start(&self, message: &Message) {
        let Some(user) = &message.from else {
            return;
        };
        self.writer
            .enqueue(StoreWrite::UpsertUser { user_id: user.id });

        let caption = format!(
            "<b>Hello {}!</b> 👋\n\n\
             I keep groups clean: links are deleted on sight and repeat\n\
             spammers are muted for a while.\n\n\
             <b>What I do</b>\n\
             ✅ Automatic link removal, no setup required\n\
             ✅ Temporary mute after repeated link spam\n\n\
             <b>How to use me</b>\n\
             ➕ Add me to your group\n\
             ⭐️ Grant me admin rights",
            escape_html(&user.first_name)
        );
        let keyboard = self.config.bot_username.as_ref().map(|username| {
            InlineKeyboardMarkup::single_row(vec![InlineKeyboardButton::link(
                "➕ Add me to your group",
                format!("https://t.me/{username}?startgroup=true"),
            )])
        });
        let reply = match &self.config.start_image_url {
            Some(image) => {
                self.client
                    .send_photo_html(message.chat.id, image, &caption, keyboard.as_ref())
                    .await
            }
            None => {
                self.client
                    .send_html_message(message.chat.id, &caption, keyboard.as_ref())
                    .await
            }
        };
        if let Err(error) = reply {
            warn!(chat_id = message.chat.id, %error, "start reply failed");
        }
    }

    async fn cmd_stats(&self, message: &Message) {
        let user_count = self.store.count_users().await.unwrap_or(0);
        let chat_count = self.store.count_chats(false).await.unwrap_or(0);
        let admin_count = self.store.count_chats(true).await.unwrap_or(0);
        let uptime = current_unix_timestamp().saturating_sub(self.started_unix);
        let text = format!(
            "📊 <b>Bot statistics</b>\n\n\
             👤 Users: <b>{user_count}</b>\n\
             👥 Groups: <b>{chat_count}</b>\n\n\
             🔐 Admin groups: <b>{admin_count}</b>\n\
             ⚠️ Non-admin groups: <b>{}</b>\n\n\
             ⏱ Uptime: <b>{}</b>",
            chat_count.saturating_sub(admin_count),
            format_uptime(uptime)
        );
        if let Err(error) = self
            .client
            .send_html_message(message.chat.id, &text, None)
            .await
        {
            warn!(%error, "stats reply failed");
        }
    }

    async fn cmd_refresh(&self, message: &Message) {
        let Some(author) = &message.from else {
            return;
        };
        let chat_id = message.chat.id;
        self.writer.enqueue(StoreWrite::UpsertChat { chat_id });
        match self.permissions.is_user_admin(chat_id, author.id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                debug!(chat_id, %error, "refresh author check failed");
                return;
            }
        }

        self.permissions.invalidate_chat(chat_id);
        let authorization = self.permissions.is_bot_authorized(chat_id).await;
        let text = "🔄 <b>Refresh complete</b>\n\n\
                    ✅ Admin caches cleared\n\
                    ✅ Bot permission re-checked";
        if let Err(error) = self
            .client
            .send_html_message(authorization.chat_id, text, None)
            .await
        {
            warn!(chat_id, %error, "refresh reply failed");
        }
    }

    async fn cmd_refresh_all(&self, message: &Message) {
        let mut refreshed = 0_u64;
        let mut removed = 0_u64;
        let mut after_id = i64::MIN;
        loop {
            let page = match self
                .store
                .scan_chats(after_id, REFRESH_SWEEP_PAGE_SIZE, false)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    warn!(%error, "refresh_all scan failed");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            after_id = page[page.len() - 1].chat_id;
            for row in page {
                self.permissions.invalidate_chat(row.chat_id);
                let authorization = self.permissions.is_bot_authorized(row.chat_id).await;
                if authorization.authorized {
                    refreshed += 1;
                } else {
                    self.writer.enqueue(StoreWrite::DeleteChat {
                        chat_id: row.chat_id,
                    });
                    removed += 1;
                }
            }
        }

        info!(refreshed, removed, "directory sweep finished");
        let text = format!(
            "🔄 <b>Refresh-all complete</b>\n\n\
             ✅ Active groups: {refreshed}\n\
             ❌ Removed groups: {removed}"
        );
        if let Err(error) = self
            .client
            .send_html_message(message.chat.id, &text, None)
            .await
        {
            warn!(%error, "refresh_all reply failed");
        }
    }

    async fn cmd_broadcast(&self, message: &Message) {
        // drop the command token itself; the rest is the broadcast text
        let text = message
            .text_or_caption()
            .and_then(|raw| raw.split_once(char::is_whitespace).map(|(_, rest)| rest))
            .map(|rest| rest.trim().to_string())
            .filter(|cleaned| !cleaned.is_empty());
        let content = BroadcastContent::from_message(message, text);
        if let Err(error) = self.broadcast.propose(self.config.owner_id, content) {
            debug!(%error, "broadcast draft rejected");
            if let Err(error) = self
                .client
                .send_message(
                    message.chat.id,
                    "❌ Nothing to broadcast: add text or an attachment.",
                )
                .await
            {
                warn!(%error, "broadcast rejection reply failed");
            }
            return;
        }

        let keyboard = InlineKeyboardMarkup::rows(vec![
            vec![
                InlineKeyboardButton::callback("👤 Users", "broadcast_confirm:users"),
                InlineKeyboardButton::callback("👥 Groups", "broadcast_confirm:groups"),
            ],
            vec![
                InlineKeyboardButton::callback("📣 Everyone", "broadcast_confirm:all"),
                InlineKeyboardButton::callback("❌ Cancel", CALLBACK_BROADCAST_CANCEL),
            ],
        ]);
        if let Err(error) = self
            .client
            .send_html_message(
                message.chat.id,
                "📢 <b>Confirm broadcast</b>\n\nChoose the audience:",
                Some(&keyboard),
            )
            .await
        {
            warn!(%error, "broadcast confirm prompt failed");
        }
    }

    /// Handles broadcast confirm/cancel callback queries.
    pub async fn handle_callback(&self, query: &CallbackQuery) {
        if let Err(error) = self.client.answer_callback_query(&query.id).await {
            debug!(%error, "callback ack failed");
        }
        if query.from.id != self.config.owner_id {
            return;
        }
        let Some(data) = query.data.as_deref() else {
            return;
        };
        let Some(prompt) = &query.message else {
            return;
        };

        if data == CALLBACK_BROADCAST_CANCEL {
            self.broadcast.cancel(self.config.owner_id);
            if let Err(error) = self
                .client
                .edit_html_message(
                    prompt.chat.id,
                    prompt.message_id,
                    "❌ Broadcast cancelled.",
                )
                .await
            {
                debug!(%error, "cancel edit failed");
            }
            return;
        }

        let Some(selector) = data
            .strip_prefix(CALLBACK_BROADCAST_CONFIRM_PREFIX)
            .and_then(parse_selector)
        else {
            return;
        };

        if let Err(error) = self
            .client
            .edit_html_message(
                prompt.chat.id,
                prompt.message_id,
                "📢 <b>Broadcasting…</b>\n\n⏳ Progress: 0%",
            )
            .await
        {
            debug!(%error, "broadcast kickoff edit failed");
        }
        // The dispatch runs to completion off the event loop so moderation
        // stays responsive during a large fan-out.
        let broadcast = Arc::clone(&self.broadcast);
        let owner_id = self.config.owner_id;
        let progress_chat_id = prompt.chat.id;
        let progress_message_id = prompt.message_id;
        tokio::spawn(async move {
            match broadcast
                .confirm(owner_id, selector, progress_chat_id, progress_message_id)
                .await
            {
                Ok(report) => info!(
                    total = report.total,
                    processed = report.processed,
                    pruned = report.pruned,
                    "broadcast dispatch complete"
                ),
                Err(error) => warn!(%error, "broadcast dispatch failed"),
            }
        });
    }
}

/// First whitespace-separated token with any `@botname` suffix removed.
fn command_token(message: &Message) -> Option<String> {
    let raw = message.text_or_caption()?.split_whitespace().next()?;
    if !raw.starts_with('/') {
        return None;
    }
    Some(
        raw.split('@')
            .next()
            .unwrap_or(raw)
            .to_ascii_lowercase(),
    )
}

fn parse_selector(raw: &str) -> Option<TargetSelector> {
    match raw {
        "users" => Some(TargetSelector::Users),
        "groups" => Some(TargetSelector::Groups),
        "all" => Some(TargetSelector::All),
        _ => None,
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

//! Owner-initiated broadcast fan-out.
//!
//! One pending draft per operator; confirming streams recipient ids from the
//! directory in fixed-size pages and sends in fixed-size concurrent batches.
//! Flood-control answers sleep exactly the requested duration and retry;
//! permanently dead recipients are pruned asynchronously; migrated chats get
//! their directory row rewritten and one retry. Once confirmed a dispatch
//! runs to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use vela_core::current_unix_timestamp;
use vela_store::{SqliteEngineStore, StoreWrite, StoreWriter};
use vela_telegram::{AttachmentKind, Message, TelegramClient};

use crate::broadcast_progress::{format_elapsed, render_progress};
use crate::BroadcastError;

const DEFAULT_PAGE_SIZE: u32 = 500;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_PROGRESS_EVERY: u64 = 30;
const DEFAULT_PROGRESS_SEGMENTS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Recipient ids fetched from the directory per page.
    pub page_size: u32,
    /// Concurrent sends per batch.
    pub batch_size: usize,
    /// Progress-message edit cadence, in processed recipients.
    pub progress_every: u64,
    /// Discrete segments of the progress bar.
    pub progress_segments: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            progress_every: DEFAULT_PROGRESS_EVERY,
            progress_segments: DEFAULT_PROGRESS_SEGMENTS,
        }
    }
}

/// Which directory partitions a confirmed broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelector {
    Users,
    Groups,
    All,
}

impl TargetSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Groups => "groups",
            Self::All => "all",
        }
    }

    pub fn includes_users(self) -> bool {
        matches!(self, Self::Users | Self::All)
    }

    pub fn includes_groups(self) -> bool {
        matches!(self, Self::Groups | Self::All)
    }
}

/// Text and/or one attachment reference to fan out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastContent {
    pub text: Option<String>,
    pub attachment: Option<(AttachmentKind, String)>,
}

impl BroadcastContent {
    /// Extracts re-sendable content from an operator message. Attachment
    /// precedence mirrors the platform's own caption rules: photo, video,
    /// audio, document.
    pub fn from_message(message: &Message, text: Option<String>) -> Self {
        let attachment = if let Some(photo) = message.photo.last() {
            Some((AttachmentKind::Photo, photo.file_id.clone()))
        } else if let Some(video) = &message.video {
            Some((AttachmentKind::Video, video.file_id.clone()))
        } else if let Some(audio) = &message.audio {
            Some((AttachmentKind::Audio, audio.file_id.clone()))
        } else if let Some(document) = &message.document {
            Some((AttachmentKind::Document, document.file_id.clone()))
        } else {
            None
        };
        Self { text, attachment }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |text| text.is_empty()) && self.attachment.is_none()
    }
}

/// Final accounting for one confirmed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub total: u64,
    pub processed: u64,
    pub users: u64,
    pub chats: u64,
    pub pruned: u64,
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientKind {
    User,
    Chat,
}

#[derive(Debug, Clone, Copy)]
struct Recipient {
    id: i64,
    kind: RecipientKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryDisposition {
    Sent,
    Pruned,
    Skipped,
}

pub struct BroadcastDispatcher {
    client: Arc<TelegramClient>,
    store: Arc<SqliteEngineStore>,
    writer: StoreWriter,
    config: BroadcastConfig,
    pending: Mutex<HashMap<i64, BroadcastContent>>,
}

impl BroadcastDispatcher {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<SqliteEngineStore>,
        writer: StoreWriter,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            client,
            store,
            writer,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Stores one pending draft for the operator, replacing any previous
    /// unconfirmed draft. Empty content is rejected outright.
    pub fn propose(&self, owner_id: i64, content: BroadcastContent) -> Result<(), BroadcastError> {
        if content.is_empty() {
            return Err(BroadcastError::EmptyContent);
        }
        lock_unpoisoned(&self.pending).insert(owner_id, content);
        Ok(())
    }

    /// Clears an unconfirmed draft; returns whether one existed.
    pub fn cancel(&self, owner_id: i64) -> bool {
        lock_unpoisoned(&self.pending).remove(&owner_id).is_some()
    }

    /// Runs the confirmed dispatch to completion, editing the progress
    /// message at a bounded cadence and once more when done.
    pub async fn confirm(
        &self,
        owner_id: i64,
        selector: TargetSelector,
        progress_chat_id: i64,
        progress_message_id: i64,
    ) -> Result<BroadcastReport, BroadcastError> {
        let content = lock_unpoisoned(&self.pending)
            .remove(&owner_id)
            .ok_or(BroadcastError::NoDraft(owner_id))?;

        let started_unix = current_unix_timestamp();
        let user_total = if selector.includes_users() {
            self.store.count_users().await?
        } else {
            0
        };
        let chat_total = if selector.includes_groups() {
            self.store.count_chats(true).await?
        } else {
            0
        };
        let total = user_total.saturating_add(chat_total);
        info!(owner_id, selector = selector.as_str(), total, "broadcast confirmed");

        let mut progress = ProgressTracker {
            processed: 0,
            pruned: 0,
            last_bucket: 0,
            total,
        };

        if selector.includes_users() {
            self.dispatch_partition(
                RecipientKind::User,
                &content,
                &mut progress,
                progress_chat_id,
                progress_message_id,
            )
            .await;
        }
        if selector.includes_groups() {
            self.dispatch_partition(
                RecipientKind::Chat,
                &content,
                &mut progress,
                progress_chat_id,
                progress_message_id,
            )
            .await;
        }

        let elapsed_secs = current_unix_timestamp().saturating_sub(started_unix);
        let report = BroadcastReport {
            total,
            processed: progress.processed,
            users: user_total,
            chats: chat_total,
            pruned: progress.pruned,
            elapsed_secs,
        };
        let summary = format!(
            "✅ <b>Broadcast completed</b>\n\n👤 Users: {}\n👥 Groups: {}\n🗑 Removed recipients: {}\n⏱ Time: {}",
            report.users,
            report.chats,
            report.pruned,
            format_elapsed(report.elapsed_secs)
        );
        if let Err(error) = self
            .client
            .edit_html_message(progress_chat_id, progress_message_id, &summary)
            .await
        {
            debug!(%error, "broadcast summary edit failed");
        }
        info!(
            processed = report.processed,
            pruned = report.pruned,
            elapsed_secs = report.elapsed_secs,
            "broadcast finished"
        );
        Ok(report)
    }

    async fn dispatch_partition(
        &self,
        kind: RecipientKind,
        content: &BroadcastContent,
        progress: &mut ProgressTracker,
        progress_chat_id: i64,
        progress_message_id: i64,
    ) {
        let mut after_id = i64::MIN;
        loop {
            let remaining = progress.total.saturating_sub(progress.processed);
            if remaining == 0 {
                return;
            }
            let page = match self.scan_page(kind, after_id).await {
                Ok(page) => page,
                Err(error) => {
                    warn!(%error, "recipient page scan failed; stopping partition");
                    return;
                }
            };
            if page.is_empty() {
                return;
            }
            after_id = page[page.len() - 1];
            let mut page = page;
            page.truncate(remaining.min(usize::MAX as u64) as usize);

            for chunk in page.chunks(self.config.batch_size.max(1)) {
                let deliveries = join_all(chunk.iter().map(|&id| {
                    self.deliver_with_retry(Recipient { id, kind }, content)
                }))
                .await;
                progress.processed = progress
                    .processed
                    .saturating_add(deliveries.len() as u64)
                    .min(progress.total);
                progress.pruned += deliveries
                    .iter()
                    .filter(|disposition| **disposition == DeliveryDisposition::Pruned)
                    .count() as u64;

                let bucket = progress.processed / self.config.progress_every.max(1);
                if bucket != progress.last_bucket {
                    progress.last_bucket = bucket;
                    self.edit_progress(progress_chat_id, progress_message_id, progress)
                        .await;
                }
            }
        }
    }

    async fn scan_page(
        &self,
        kind: RecipientKind,
        after_id: i64,
    ) -> Result<Vec<i64>, vela_store::StoreError> {
        match kind {
            RecipientKind::User => self.store.scan_users(after_id, self.config.page_size).await,
            RecipientKind::Chat => Ok(self
                .store
                .scan_chats(after_id, self.config.page_size, true)
                .await?
                .into_iter()
                .map(|row| row.chat_id)
                .collect()),
        }
    }

    async fn deliver_with_retry(
        &self,
        recipient: Recipient,
        content: &BroadcastContent,
    ) -> DeliveryDisposition {
        let mut target_id = recipient.id;
        let mut migration_retried = false;
        loop {
            let error = match self.send_content(target_id, content).await {
                Ok(()) => return DeliveryDisposition::Sent,
                Err(error) => error,
            };
            if let Some(wait_secs) = error.retry_after() {
                debug!(target_id, wait_secs, "rate limited; sleeping before retry");
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }
            if let Some(new_chat_id) = error.migrated_to() {
                if recipient.kind == RecipientKind::Chat && !migration_retried {
                    if let Err(error) = self.store.migrate_chat(target_id, new_chat_id).await {
                        warn!(target_id, new_chat_id, %error, "directory rewrite failed");
                    }
                    target_id = new_chat_id;
                    migration_retried = true;
                    continue;
                }
                return DeliveryDisposition::Skipped;
            }
            if error.is_permanent() {
                self.writer.enqueue(match recipient.kind {
                    RecipientKind::User => StoreWrite::DeleteUser {
                        user_id: recipient.id,
                    },
                    RecipientKind::Chat => StoreWrite::DeleteChat { chat_id: target_id },
                });
                return DeliveryDisposition::Pruned;
            }
            debug!(target_id, %error, "transient delivery failure; skipping recipient");
            return DeliveryDisposition::Skipped;
        }
    }

    async fn send_content(
        &self,
        chat_id: i64,
        content: &BroadcastContent,
    ) -> Result<(), vela_telegram::TelegramError> {
        match &content.attachment {
            Some((kind, file_id)) => {
                self.client
                    .send_attachment(chat_id, *kind, file_id, content.text.as_deref())
                    .await?;
            }
            None => {
                self.client
                    .send_message(chat_id, content.text.as_deref().unwrap_or_default())
                    .await?;
            }
        }
        Ok(())
    }

    async fn edit_progress(&self, chat_id: i64, message_id: i64, progress: &ProgressTracker) {
        let text = format!(
            "📢 <b>Broadcasting…</b>\n\n⏳ Progress: {}",
            render_progress(
                progress.processed,
                progress.total,
                self.config.progress_segments
            )
        );
        if let Err(error) = self.client.edit_html_message(chat_id, message_id, &text).await {
            debug!(%error, "broadcast progress edit failed");
        }
    }
}

struct ProgressTracker {
    processed: u64,
    pruned: u64,
    last_bucket: u64,
    total: u64,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

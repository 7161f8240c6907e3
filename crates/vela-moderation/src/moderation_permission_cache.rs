//! Permission cache & reconciliation.
//!
//! Answers "is the bot authorized to moderate chat X" and "is user U an
//! admin of chat X" from process-local caches, re-verifying against platform
//! truth at most once per verification interval. Chat-identity migration and
//! unreachable-chat purging are centralized here so every call site that
//! observes a migration signal funnels through one `migrate` operation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use vela_core::current_unix_timestamp;
use vela_store::{SqliteEngineStore, StoreWrite, StoreWriter};
use vela_telegram::{MemberStatus, TelegramClient, TelegramError};

const DEFAULT_VERIFICATION_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
pub struct PermissionCacheConfig {
    /// Seconds a positive/negative bot-authority answer stays trusted
    /// before the next live re-verification.
    pub verification_interval_secs: u64,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            verification_interval_secs: DEFAULT_VERIFICATION_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChatAdminState {
    is_admin: bool,
    last_verified_unix: u64,
}

/// Outcome of an authority check. `chat_id` is the identity the caller must
/// use for follow-up actions; it differs from the input when the chat
/// migrated during the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotAuthorization {
    pub authorized: bool,
    pub chat_id: i64,
}

type MigrationListener = Box<dyn Fn(i64, i64) + Send + Sync>;
type PurgeListener = Box<dyn Fn(i64) + Send + Sync>;

/// Process-wide authority cache, injected into every component that needs
/// authority answers.
pub struct PermissionCache {
    config: PermissionCacheConfig,
    client: Arc<TelegramClient>,
    store: Arc<SqliteEngineStore>,
    writer: StoreWriter,
    bot_id: i64,
    bot_admin: Mutex<HashMap<i64, ChatAdminState>>,
    user_admins: Mutex<HashMap<i64, HashSet<i64>>>,
    migration_listeners: Mutex<Vec<MigrationListener>>,
    purge_listeners: Mutex<Vec<PurgeListener>>,
}

impl PermissionCache {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<SqliteEngineStore>,
        writer: StoreWriter,
        bot_id: i64,
        config: PermissionCacheConfig,
    ) -> Self {
        Self {
            config,
            client,
            store,
            writer,
            bot_id,
            bot_admin: Mutex::new(HashMap::new()),
            user_admins: Mutex::new(HashMap::new()),
            migration_listeners: Mutex::new(Vec::new()),
            purge_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers an in-memory remap to run inside `migrate`. Listeners must
    /// not block: they run under the listener lock on the event task.
    pub fn register_migration_listener(&self, listener: MigrationListener) {
        lock_unpoisoned(&self.migration_listeners).push(listener);
    }

    /// Registers an in-memory cleanup to run inside `purge`.
    pub fn register_purge_listener(&self, listener: PurgeListener) {
        lock_unpoisoned(&self.purge_listeners).push(listener);
    }

    /// Cached authority answer, re-verified live once the verification
    /// interval lapses. Never treats a transient failure as a demotion.
    pub async fn is_bot_authorized(&self, chat_id: i64) -> BotAuthorization {
        let now = current_unix_timestamp();
        if let Some(state) = self.cached_state(chat_id) {
            if now.saturating_sub(state.last_verified_unix) < self.config.verification_interval_secs
            {
                return BotAuthorization {
                    authorized: state.is_admin,
                    chat_id,
                };
            }
        }
        self.verify_live(chat_id, now).await
    }

    async fn verify_live(&self, chat_id: i64, now: u64) -> BotAuthorization {
        let mut chat_id = chat_id;
        let mut migration_retried = false;
        loop {
            match self.client.get_chat_member(chat_id, self.bot_id).await {
                Ok(member) => {
                    let is_admin = member.status.is_admin();
                    self.record_verified(chat_id, is_admin, now);
                    return BotAuthorization {
                        authorized: is_admin,
                        chat_id,
                    };
                }
                Err(error) => {
                    if let Some(new_chat_id) = error.migrated_to() {
                        self.migrate(chat_id, new_chat_id).await;
                        chat_id = new_chat_id;
                        if !migration_retried {
                            migration_retried = true;
                            continue;
                        }
                        return BotAuthorization {
                            authorized: false,
                            chat_id,
                        };
                    }
                    if error.is_unreachable() {
                        info!(chat_id, %error, "chat unreachable; purging state");
                        self.purge(chat_id).await;
                        return BotAuthorization {
                            authorized: false,
                            chat_id,
                        };
                    }
                    // Stale-but-available: keep whatever we knew last.
                    debug!(chat_id, %error, "authority check failed transiently");
                    let stale = self
                        .cached_state(chat_id)
                        .map(|state| state.is_admin)
                        .unwrap_or(false);
                    return BotAuthorization {
                        authorized: stale,
                        chat_id,
                    };
                }
            }
        }
    }

    /// Soft-cached user-admin check. Only positive answers are cached; a
    /// non-admin may be promoted at any time and must be re-checked on
    /// their next action.
    pub async fn is_user_admin(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<bool, TelegramError> {
        {
            let cache = lock_unpoisoned(&self.user_admins);
            if cache
                .get(&chat_id)
                .is_some_and(|admins| admins.contains(&user_id))
            {
                return Ok(true);
            }
        }
        let member = self.client.get_chat_member(chat_id, user_id).await?;
        let is_admin = member.status.is_admin();
        if is_admin {
            lock_unpoisoned(&self.user_admins)
                .entry(chat_id)
                .or_default()
                .insert(user_id);
        }
        Ok(is_admin)
    }

    /// Membership-change hook. Any event wholesale-invalidates the chat's
    /// user-admin set; when the subject is the bot itself the admin flag is
    /// updated in place and persisted.
    pub fn on_membership_changed(
        &self,
        chat_id: i64,
        subject_is_bot: bool,
        new_status: MemberStatus,
    ) {
        lock_unpoisoned(&self.user_admins).remove(&chat_id);
        if !subject_is_bot {
            return;
        }
        let is_admin = new_status.is_admin();
        self.record_verified(chat_id, is_admin, current_unix_timestamp());
        if new_status.is_present() {
            self.writer.enqueue(StoreWrite::UpsertChat { chat_id });
        }
    }

    /// Drops both cache entries for a chat, forcing the next check live.
    pub fn invalidate_chat(&self, chat_id: i64) {
        lock_unpoisoned(&self.bot_admin).remove(&chat_id);
        lock_unpoisoned(&self.user_admins).remove(&chat_id);
    }

    /// Moves every piece of cached and persisted chat state from `old` to
    /// `new`: admin flag, user-admin set, spam counters and scheduled jobs
    /// (via registered listeners), and the store rows.
    pub async fn migrate(&self, old_chat_id: i64, new_chat_id: i64) {
        info!(old_chat_id, new_chat_id, "migrating chat identity");
        {
            let mut bot_admin = lock_unpoisoned(&self.bot_admin);
            if let Some(state) = bot_admin.remove(&old_chat_id) {
                bot_admin.insert(new_chat_id, state);
            }
        }
        {
            let mut user_admins = lock_unpoisoned(&self.user_admins);
            if let Some(admins) = user_admins.remove(&old_chat_id) {
                user_admins.insert(new_chat_id, admins);
            }
        }
        for listener in lock_unpoisoned(&self.migration_listeners).iter() {
            listener(old_chat_id, new_chat_id);
        }
        if let Err(error) = self.store.migrate_chat(old_chat_id, new_chat_id).await {
            warn!(old_chat_id, new_chat_id, %error, "persisted chat migration failed");
        }
    }

    /// Clears every piece of cached and persisted state for an unreachable
    /// chat.
    pub async fn purge(&self, chat_id: i64) {
        self.invalidate_chat(chat_id);
        for listener in lock_unpoisoned(&self.purge_listeners).iter() {
            listener(chat_id);
        }
        if let Err(error) = self.store.purge_chat(chat_id).await {
            warn!(chat_id, %error, "persisted chat purge failed");
        }
    }

    fn cached_state(&self, chat_id: i64) -> Option<ChatAdminState> {
        lock_unpoisoned(&self.bot_admin).get(&chat_id).copied()
    }

    fn record_verified(&self, chat_id: i64, is_admin: bool, now: u64) {
        lock_unpoisoned(&self.bot_admin).insert(
            chat_id,
            ChatAdminState {
                is_admin,
                last_verified_unix: now,
            },
        );
        self.writer
            .enqueue(StoreWrite::SetChatAdmin { chat_id, is_admin });
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

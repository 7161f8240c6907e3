//! Spam counter / escalation.
//!
//! Tracks link violations per `(chat, user)` with a sliding reset window and
//! triggers a temporary mute when the threshold is crossed. The in-memory
//! map is the fast path of record; the persisted row is written behind it
//! through the fire-and-forget store writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use vela_core::current_unix_timestamp;
use vela_store::{SpamCounterRow, SqliteEngineStore, StoreWrite, StoreWriter};
use vela_telegram::{ChatKind, ChatPermissions, TelegramClient};

const DEFAULT_VIOLATION_THRESHOLD: u32 = 3;
const DEFAULT_MUTE_SECS: u64 = 600;
const DEFAULT_RESET_WINDOW_SECS: u64 = 3_600;
const DEFAULT_IDLE_TTL_SECS: u64 = 86_400;
const DEFAULT_STORE_READ_TIMEOUT_MS: u64 = 500;
const IDLE_SWEEP_MIN_ENTRIES: usize = 256;

/// Tunable escalation policy. These are configuration constants, not
/// hard-coded business rules.
#[derive(Debug, Clone, Copy)]
pub struct SpamPolicy {
    /// Violations inside the window that trigger a mute.
    pub violation_threshold: u32,
    /// Mute duration applied on escalation.
    pub mute_secs: u64,
    /// Idle span after which a counter restarts at 1 instead of
    /// incrementing.
    pub reset_window_secs: u64,
    /// Idle span after which a counter is evicted from memory entirely.
    pub idle_ttl_secs: u64,
    /// Budget for the persistent-store fallback read; a timeout reads as
    /// "no prior record".
    pub store_read_timeout_ms: u64,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            violation_threshold: DEFAULT_VIOLATION_THRESHOLD,
            mute_secs: DEFAULT_MUTE_SECS,
            reset_window_secs: DEFAULT_RESET_WINDOW_SECS,
            idle_ttl_secs: DEFAULT_IDLE_TTL_SECS,
            store_read_timeout_ms: DEFAULT_STORE_READ_TIMEOUT_MS,
        }
    }
}

/// Outcome of recording one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamVerdict {
    /// Counted; the author stays below the mute threshold.
    Counted { count: u32 },
    /// This violation crossed the threshold and the mute was applied.
    MutedNow,
    /// A mute window is already open; nothing new was enforced.
    AlreadyMuted,
}

impl SpamVerdict {
    /// True when the author is muted after this violation.
    pub fn muted(self) -> bool {
        matches!(self, Self::MutedNow | Self::AlreadyMuted)
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    count: u32,
    last_violation_unix: u64,
    mute_until_unix: Option<u64>,
}

/// Owned violation-counter service.
pub struct SpamLedger {
    policy: SpamPolicy,
    client: Arc<TelegramClient>,
    store: Arc<SqliteEngineStore>,
    writer: StoreWriter,
    counters: Mutex<HashMap<(i64, i64), CounterState>>,
}

impl SpamLedger {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<SqliteEngineStore>,
        writer: StoreWriter,
        policy: SpamPolicy,
    ) -> Self {
        Self {
            policy,
            client,
            store,
            writer,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SpamPolicy {
        &self.policy
    }

    /// Records one confirmed violation. Idempotent while a mute window is
    /// open: repeat violations report `AlreadyMuted` without a second
    /// restriction call.
    pub async fn record_violation(
        &self,
        chat_id: i64,
        user_id: i64,
        chat_kind: ChatKind,
    ) -> SpamVerdict {
        self.record_violation_at(chat_id, user_id, chat_kind, current_unix_timestamp())
            .await
    }

    async fn record_violation_at(
        &self,
        chat_id: i64,
        user_id: i64,
        chat_kind: ChatKind,
        now: u64,
    ) -> SpamVerdict {
        let key = (chat_id, user_id);
        let state = match lock_unpoisoned(&self.counters).get(&key).copied() {
            Some(state) => Some(state),
            None => self
                .load_persisted(chat_id, user_id)
                .await
                .map(|row| CounterState {
                    count: row.count,
                    last_violation_unix: row.last_violation_unix,
                    mute_until_unix: None,
                }),
        };

        if let Some(state) = state {
            if let Some(until) = state.mute_until_unix {
                if now < until {
                    return SpamVerdict::AlreadyMuted;
                }
            }
        }

        let count = match state {
            Some(state)
                if now.saturating_sub(state.last_violation_unix)
                    <= self.policy.reset_window_secs =>
            {
                state.count.saturating_add(1)
            }
            _ => 1,
        };

        {
            let mut counters = lock_unpoisoned(&self.counters);
            counters.insert(
                key,
                CounterState {
                    count,
                    last_violation_unix: now,
                    mute_until_unix: None,
                },
            );
            if counters.len() >= IDLE_SWEEP_MIN_ENTRIES {
                let idle_ttl = self.policy.idle_ttl_secs;
                counters.retain(|_, entry| {
                    now.saturating_sub(entry.last_violation_unix) <= idle_ttl
                        || entry.mute_until_unix.is_some_and(|until| until > now)
                });
            }
        }
        self.writer.enqueue(StoreWrite::UpsertSpamCounter {
            chat_id,
            user_id,
            row: SpamCounterRow {
                count,
                last_violation_unix: now,
            },
        });

        if count < self.policy.violation_threshold || !chat_kind.supports_restriction() {
            return SpamVerdict::Counted { count };
        }

        let until = now.saturating_add(self.policy.mute_secs);
        match self
            .client
            .restrict_chat_member(chat_id, user_id, &ChatPermissions::muted(), until)
            .await
        {
            Ok(_) => {
                lock_unpoisoned(&self.counters).insert(
                    key,
                    CounterState {
                        count: 0,
                        last_violation_unix: now,
                        mute_until_unix: Some(until),
                    },
                );
                self.writer
                    .enqueue(StoreWrite::ClearSpamCounter { chat_id, user_id });
                SpamVerdict::MutedNow
            }
            Err(error) => {
                // Counter stays put so the next violation retries the mute.
                warn!(chat_id, user_id, %error, "restriction failed");
                SpamVerdict::Counted { count }
            }
        }
    }

    async fn load_persisted(&self, chat_id: i64, user_id: i64) -> Option<SpamCounterRow> {
        let budget = Duration::from_millis(self.policy.store_read_timeout_ms.max(1));
        match tokio::time::timeout(budget, self.store.fetch_spam_counter(chat_id, user_id)).await {
            Ok(Ok(row)) => row,
            Ok(Err(error)) => {
                debug!(chat_id, user_id, %error, "counter fallback read failed");
                None
            }
            Err(_) => {
                debug!(chat_id, user_id, "counter fallback read timed out");
                None
            }
        }
    }

    /// In-memory remap for a chat-identity migration.
    pub fn migrate_chat(&self, old_chat_id: i64, new_chat_id: i64) {
        let mut counters = lock_unpoisoned(&self.counters);
        let moved: Vec<(i64, CounterState)> = counters
            .iter()
            .filter(|((chat, _), _)| *chat == old_chat_id)
            .map(|((_, user), state)| (*user, *state))
            .collect();
        counters.retain(|(chat, _), _| *chat != old_chat_id);
        for (user, state) in moved {
            counters.insert((new_chat_id, user), state);
        }
    }

    /// Drops every in-memory counter for an unreachable chat.
    pub fn purge_chat(&self, chat_id: i64) {
        lock_unpoisoned(&self.counters).retain(|(chat, _), _| *chat != chat_id);
    }

    #[cfg(test)]
    fn cached_count(&self, chat_id: i64, user_id: i64) -> Option<u32> {
        lock_unpoisoned(&self.counters)
            .get(&(chat_id, user_id))
            .map(|state| state.count)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use vela_telegram::{TelegramClient, TelegramClientConfig};

    fn build_ledger(
        server: &MockServer,
        store: SqliteEngineStore,
        policy: SpamPolicy,
    ) -> (SpamLedger, tokio::task::JoinHandle<()>) {
        let client = TelegramClient::new(TelegramClientConfig {
            api_base: server.base_url(),
            bot_token: "tt".to_string(),
            http_timeout_ms: 2_000,
        })
        .expect("client");
        let (writer, handle) = StoreWriter::spawn(store.clone());
        (
            SpamLedger::new(Arc::new(client), Arc::new(store), writer, policy),
            handle,
        )
    }

    fn temp_store() -> (tempfile::TempDir, SqliteEngineStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteEngineStore::new(dir.path().join("vela.db")).expect("store");
        (dir, store)
    }

    async fn restrict_ok(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bottt/restrictChatMember");
                then.status(200).json_body(json!({"ok": true, "result": true}));
            })
            .await
    }

    #[tokio::test]
    async fn functional_threshold_mutes_once_and_is_idempotent_while_muted() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());
        let restrict = restrict_ok(&server).await;

        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 0).await,
            SpamVerdict::Counted { count: 1 }
        );
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 10).await,
            SpamVerdict::Counted { count: 2 }
        );
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 20).await,
            SpamVerdict::MutedNow
        );
        // still muted at t=30: no second restriction call
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 30).await,
            SpamVerdict::AlreadyMuted
        );
        restrict.assert_calls_async(1).await;
        assert_eq!(ledger.cached_count(-1, 7), Some(0));
    }

    #[tokio::test]
    async fn unit_sliding_window_resets_count() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());

        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 0).await,
            SpamVerdict::Counted { count: 1 }
        );
        // beyond the reset window: restart at 1, not 2
        assert_eq!(
            ledger
                .record_violation_at(-1, 7, ChatKind::Supergroup, 3_601)
                .await,
            SpamVerdict::Counted { count: 1 }
        );
        assert_eq!(ledger.cached_count(-1, 7), Some(1));
    }

    #[tokio::test]
    async fn unit_baseline_group_counts_but_never_restricts() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());
        let restrict = restrict_ok(&server).await;

        for t in [0_u64, 1, 2, 3] {
            assert!(!ledger
                .record_violation_at(-1, 7, ChatKind::Group, t)
                .await
                .muted());
        }
        restrict.assert_calls_async(0).await;
        assert_eq!(ledger.cached_count(-1, 7), Some(4));
    }

    #[tokio::test]
    async fn functional_failed_restriction_keeps_counter_for_retry() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());

        let denied = server
            .mock_async(|when, then| {
                when.method(POST).path("/bottt/restrictChatMember");
                then.status(400).json_body(json!({
                    "ok": false,
                    "error_code": 400,
                    "description": "Bad Request: not enough rights to restrict/unrestrict chat member"
                }));
            })
            .await;
        for t in [0_u64, 1] {
            assert!(!ledger
                .record_violation_at(-1, 7, ChatKind::Supergroup, t)
                .await
                .muted());
        }
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 2).await,
            SpamVerdict::Counted { count: 3 }
        );
        assert_eq!(ledger.cached_count(-1, 7), Some(3));
        denied.delete_async().await;

        let restrict = restrict_ok(&server).await;
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 3).await,
            SpamVerdict::MutedNow
        );
        restrict.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn functional_store_fallback_seeds_counter_on_cache_miss() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        store
            .upsert_spam_counter(
                -1,
                7,
                SpamCounterRow {
                    count: 2,
                    last_violation_unix: 5,
                },
            )
            .await
            .expect("seed");
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());
        let restrict = restrict_ok(&server).await;

        // third violation within the window crosses the threshold
        assert_eq!(
            ledger.record_violation_at(-1, 7, ChatKind::Supergroup, 10).await,
            SpamVerdict::MutedNow
        );
        restrict.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn unit_migrate_and_purge_remap_in_memory_counters() {
        let server = MockServer::start_async().await;
        let (_dir, store) = temp_store();
        let (ledger, _handle) = build_ledger(&server, store, SpamPolicy::default());

        assert!(!ledger
            .record_violation_at(-1, 7, ChatKind::Supergroup, 0)
            .await
            .muted());
        ledger.migrate_chat(-1, -2);
        assert_eq!(ledger.cached_count(-1, 7), None);
        assert_eq!(ledger.cached_count(-2, 7), Some(1));
        ledger.purge_chat(-2);
        assert_eq!(ledger.cached_count(-2, 7), None);
    }
}

//! Shared harness: a fully wired engine pointed at an `httpmock` server.
#![allow(dead_code)]

use std::sync::Arc;

use httpmock::MockServer;
use tokio::sync::mpsc;

use vela_broadcast::{BroadcastConfig, BroadcastDispatcher};
use vela_moderation::{
    ModerationPipeline, ModerationPolicy, PermissionCache, PermissionCacheConfig, SpamLedger,
    SpamPolicy,
};
use vela_runtime::{
    CommandConfig, CommandRouter, EngineRuntime, JobPayload, MembershipCoordinator,
    ReminderPolicy, ReminderScheduler, RuntimeConfig,
};
use vela_store::{SqliteEngineStore, StoreWriter};
use vela_telegram::{TelegramClient, TelegramClientConfig, Update};

pub const BOT_ID: i64 = 9_000;
pub const OWNER_ID: i64 = 77;

pub struct TestEngine {
    pub runtime: Arc<EngineRuntime>,
    pub scheduler: Arc<ReminderScheduler>,
    pub store: SqliteEngineStore,
    pub writer: StoreWriter,
    pub fired_jobs: mpsc::Receiver<JobPayload>,
    _dir: tempfile::TempDir,
    _writer_task: tokio::task::JoinHandle<()>,
}

pub fn build_engine(server: &MockServer) -> TestEngine {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteEngineStore::new(dir.path().join("vela.db")).expect("store");
    let client = Arc::new(
        TelegramClient::new(TelegramClientConfig {
            api_base: server.base_url(),
            bot_token: "tt".to_string(),
            http_timeout_ms: 2_000,
        })
        .expect("client"),
    );
    let (writer, writer_task) = StoreWriter::spawn(store.clone());
    let shared_store = Arc::new(store.clone());
    let permissions = Arc::new(PermissionCache::new(
        Arc::clone(&client),
        Arc::clone(&shared_store),
        writer.clone(),
        BOT_ID,
        PermissionCacheConfig::default(),
    ));
    let spam = Arc::new(SpamLedger::new(
        Arc::clone(&client),
        Arc::clone(&shared_store),
        writer.clone(),
        SpamPolicy::default(),
    ));
    {
        let spam_mig = Arc::clone(&spam);
        permissions.register_migration_listener(Box::new(move |old, new| {
            spam_mig.migrate_chat(old, new);
        }));
        let spam_purge = Arc::clone(&spam);
        permissions.register_purge_listener(Box::new(move |chat_id| {
            spam_purge.purge_chat(chat_id);
        }));
    }
    let pipeline = Arc::new(ModerationPipeline::new(
        Arc::clone(&client),
        Arc::clone(&permissions),
        Arc::clone(&spam),
        ModerationPolicy {
            exempt_user_id: Some(OWNER_ID),
        },
    ));
    let (fired_tx, fired_rx) = mpsc::channel(64);
    let scheduler = Arc::new(ReminderScheduler::new(fired_tx));
    {
        let scheduler_mig = Arc::clone(&scheduler);
        permissions.register_migration_listener(Box::new(move |old, new| {
            scheduler_mig.migrate_chat(old, new);
        }));
        let scheduler_purge = Arc::clone(&scheduler);
        permissions.register_purge_listener(Box::new(move |chat_id| {
            scheduler_purge.cancel_all(chat_id);
        }));
    }
    let membership = Arc::new(MembershipCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&permissions),
        Arc::clone(&scheduler),
        writer.clone(),
        ReminderPolicy::default(),
        BOT_ID,
        Some("vela_bot".to_string()),
    ));
    let broadcast = Arc::new(BroadcastDispatcher::new(
        Arc::clone(&client),
        Arc::clone(&shared_store),
        writer.clone(),
        BroadcastConfig {
            page_size: 50,
            batch_size: 5,
            progress_every: 10,
            progress_segments: 10,
        },
    ));
    let commands = Arc::new(CommandRouter::new(
        Arc::clone(&client),
        Arc::clone(&shared_store),
        Arc::clone(&permissions),
        broadcast,
        writer.clone(),
        CommandConfig {
            owner_id: OWNER_ID,
            start_image_url: None,
            bot_username: Some("vela_bot".to_string()),
        },
    ));
    let runtime = Arc::new(EngineRuntime::new(
        client,
        shared_store,
        permissions,
        pipeline,
        membership,
        commands,
        Arc::clone(&scheduler),
        RuntimeConfig::default(),
    ));
    TestEngine {
        runtime,
        scheduler,
        store,
        writer,
        fired_jobs: fired_rx,
        _dir: dir,
        _writer_task: writer_task,
    }
}

/// Wraps a raw update JSON value into a typed `Update`.
pub fn update_from(value: serde_json::Value) -> Update {
    serde_json::from_value(value).expect("decode update")
}

pub fn group_message(update_id: i64, chat_id: i64, user_id: i64, text: &str) -> Update {
    update_from(serde_json::json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id + 1_000,
            "chat": {"id": chat_id, "type": "supergroup"},
            "from": {"id": user_id, "is_bot": false, "first_name": "Mallory"},
            "text": text
        }
    }))
}

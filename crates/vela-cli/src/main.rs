//! `vela` binary: flag/env configuration, tracing bootstrap, service wiring,
//! and the run loop.

mod cli_args;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vela_broadcast::{BroadcastConfig, BroadcastDispatcher};
use vela_moderation::{
    ModerationPipeline, ModerationPolicy, PermissionCache, PermissionCacheConfig, SpamLedger,
    SpamPolicy,
};
use vela_runtime::{
    CommandConfig, CommandRouter, EngineRuntime, MembershipCoordinator, ReminderPolicy,
    ReminderScheduler, RuntimeConfig,
};
use vela_store::{SqliteEngineStore, StoreWriter};
use vela_telegram::{TelegramClient, TelegramClientConfig};

use crate::cli_args::Cli;

const FIRED_JOB_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.bot_token.trim().is_empty() {
        bail!("bot token cannot be empty");
    }

    let store = Arc::new(
        SqliteEngineStore::new(&args.db_path)
            .with_context(|| format!("failed to open store at {}", args.db_path.display()))?,
    );
    let client = Arc::new(
        TelegramClient::new(TelegramClientConfig {
            api_base: args.api_base.clone(),
            bot_token: args.bot_token.clone(),
            http_timeout_ms: args.http_timeout_ms,
        })
        .context("failed to build platform client")?,
    );

    let me = client
        .get_me()
        .await
        .context("getMe failed; check the bot token")?;
    info!(bot_id = me.id, username = ?me.username, "connected to the platform");

    let (writer, _writer_task) = StoreWriter::spawn((*store).clone());
    let permissions = Arc::new(PermissionCache::new(
        Arc::clone(&client),
        Arc::clone(&store),
        writer.clone(),
        me.id,
        PermissionCacheConfig {
            verification_interval_secs: args.verification_interval_secs,
        },
    ));
    let spam = Arc::new(SpamLedger::new(
        Arc::clone(&client),
        Arc::clone(&store),
        writer.clone(),
        SpamPolicy {
            violation_threshold: args.violation_threshold,
            mute_secs: args.mute_secs,
            reset_window_secs: args.reset_window_secs,
            ..SpamPolicy::default()
        },
    ));

    let (fired_tx, fired_rx) = mpsc::channel(FIRED_JOB_CHANNEL_CAPACITY);
    let scheduler = Arc::new(ReminderScheduler::new(fired_tx));

    // every migration/purge observed by the permission cache also remaps
    // in-memory counters and pending jobs
    {
        let spam_mig = Arc::clone(&spam);
        permissions.register_migration_listener(Box::new(move |old, new| {
            spam_mig.migrate_chat(old, new);
        }));
        let spam_purge = Arc::clone(&spam);
        permissions.register_purge_listener(Box::new(move |chat_id| {
            spam_purge.purge_chat(chat_id);
        }));
        let scheduler_mig = Arc::clone(&scheduler);
        permissions.register_migration_listener(Box::new(move |old, new| {
            scheduler_mig.migrate_chat(old, new);
        }));
        let scheduler_purge = Arc::clone(&scheduler);
        permissions.register_purge_listener(Box::new(move |chat_id| {
            scheduler_purge.cancel_all(chat_id);
        }));
    }

    let owner_id = (args.owner_id != 0).then_some(args.owner_id);
    let pipeline = Arc::new(ModerationPipeline::new(
        Arc::clone(&client),
        Arc::clone(&permissions),
        Arc::clone(&spam),
        ModerationPolicy {
            exempt_user_id: owner_id,
        },
    ));
    let membership = Arc::new(MembershipCoordinator::new(
        Arc::clone(&client),
        Arc::clone(&permissions),
        Arc::clone(&scheduler),
        writer.clone(),
        ReminderPolicy {
            reminder_count: args.reminder_count,
            reminder_interval_secs: args.reminder_interval_secs,
            grace_period_secs: args.grace_period_secs,
            ..ReminderPolicy::default()
        },
        me.id,
        me.username.clone(),
    ));
    let broadcast = Arc::new(BroadcastDispatcher::new(
        Arc::clone(&client),
        Arc::clone(&store),
        writer.clone(),
        BroadcastConfig {
            page_size: args.broadcast_page_size,
            batch_size: args.broadcast_batch_size,
            progress_every: args.progress_every,
            ..BroadcastConfig::default()
        },
    ));
    let commands = Arc::new(CommandRouter::new(
        Arc::clone(&client),
        Arc::clone(&store),
        Arc::clone(&permissions),
        broadcast,
        writer.clone(),
        CommandConfig {
            owner_id: args.owner_id,
            start_image_url: args.start_image.clone(),
            bot_username: me.username.clone(),
        },
    ));

    let runtime = Arc::new(EngineRuntime::new(
        client,
        store,
        permissions,
        pipeline,
        membership,
        commands,
        scheduler,
        RuntimeConfig {
            poll_timeout_secs: args.poll_timeout_secs,
            notice_ttl_secs: args.notice_ttl_secs,
            ..RuntimeConfig::default()
        },
    ));

    runtime.startup_reconcile().await;
    info!("vela moderation engine running");

    tokio::select! {
        result = runtime.run(fired_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received; flushing pending writes");
            writer.flush().await;
            Ok(())
        }
    }
}

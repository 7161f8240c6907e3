use std::path::PathBuf;

use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "vela",
    about = "Group-moderation and notification engine for Telegram",
    version
)]
pub struct Cli {
    #[arg(long, env = "VELA_BOT_TOKEN", help = "Telegram Bot API token.")]
    pub bot_token: String,

    #[arg(
        long,
        env = "VELA_OWNER_ID",
        default_value_t = 0,
        help = "Operator user id. Owns /stats, /refresh_all and /broadcast; exempt from moderation. 0 disables owner features."
    )]
    pub owner_id: i64,

    #[arg(
        long,
        env = "VELA_DB_PATH",
        default_value = "vela.db",
        help = "SQLite database path for the recipient directory and counters."
    )]
    pub db_path: PathBuf,

    #[arg(
        long,
        env = "VELA_API_BASE",
        default_value = "https://api.telegram.org",
        help = "Bot API base URL; override for tests or local gateways."
    )]
    pub api_base: String,

    #[arg(
        long,
        env = "VELA_START_IMAGE",
        help = "Optional image URL for the /start introduction."
    )]
    pub start_image: Option<String>,

    #[arg(
        long,
        env = "VELA_HTTP_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "HTTP timeout for Bot API calls, in milliseconds."
    )]
    pub http_timeout_ms: u64,

    #[arg(
        long,
        env = "VELA_POLL_TIMEOUT_SECS",
        default_value_t = 25,
        value_parser = parse_positive_u64,
        help = "getUpdates long-poll window, in seconds."
    )]
    pub poll_timeout_secs: u64,

    #[arg(
        long,
        env = "VELA_VERIFICATION_INTERVAL_SECS",
        default_value_t = 300,
        value_parser = parse_positive_u64,
        help = "Seconds a cached bot-authority answer stays trusted."
    )]
    pub verification_interval_secs: u64,

    #[arg(
        long,
        env = "VELA_VIOLATION_THRESHOLD",
        default_value_t = 3,
        value_parser = parse_positive_u32,
        help = "Link violations inside the reset window that trigger a mute."
    )]
    pub violation_threshold: u32,

    #[arg(
        long,
        env = "VELA_MUTE_SECS",
        default_value_t = 600,
        value_parser = parse_positive_u64,
        help = "Mute duration applied on escalation, in seconds."
    )]
    pub mute_secs: u64,

    #[arg(
        long,
        env = "VELA_RESET_WINDOW_SECS",
        default_value_t = 3_600,
        value_parser = parse_positive_u64,
        help = "Idle seconds after which a violation counter restarts at 1."
    )]
    pub reset_window_secs: u64,

    #[arg(
        long,
        env = "VELA_NOTICE_TTL_SECS",
        default_value_t = 10_800,
        value_parser = parse_positive_u64,
        help = "Seconds a moderation warning notice stays before deletion."
    )]
    pub notice_ttl_secs: u64,

    #[arg(
        long,
        env = "VELA_REMINDER_COUNT",
        default_value_t = 5,
        value_parser = parse_positive_u32,
        help = "Admin reminders sent before auto-leaving an admin-less chat."
    )]
    pub reminder_count: u32,

    #[arg(
        long,
        env = "VELA_REMINDER_INTERVAL_SECS",
        default_value_t = 300,
        value_parser = parse_positive_u64,
        help = "Interval between admin reminders, in seconds."
    )]
    pub reminder_interval_secs: u64,

    #[arg(
        long,
        env = "VELA_GRACE_PERIOD_SECS",
        default_value_t = 60,
        value_parser = parse_positive_u64,
        help = "Grace period before re-checking a demotion and leaving."
    )]
    pub grace_period_secs: u64,

    #[arg(
        long,
        env = "VELA_BROADCAST_PAGE_SIZE",
        default_value_t = 500,
        value_parser = parse_positive_u32,
        help = "Recipient ids fetched from the directory per page."
    )]
    pub broadcast_page_size: u32,

    #[arg(
        long,
        env = "VELA_BROADCAST_BATCH_SIZE",
        default_value_t = 10,
        value_parser = parse_positive_usize,
        help = "Concurrent sends per broadcast batch."
    )]
    pub broadcast_batch_size: usize,

    #[arg(
        long,
        env = "VELA_PROGRESS_EVERY",
        default_value_t = 30,
        value_parser = parse_positive_u64,
        help = "Broadcast progress-message edit cadence, in recipients."
    )]
    pub progress_every: u64,
}

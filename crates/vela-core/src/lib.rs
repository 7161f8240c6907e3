//! Foundational low-level utilities shared across Vela crates.
//!
//! Provides time utilities used by cache expiry arithmetic, scheduler delay
//! computation, and uptime reporting.

pub mod time_utils;

pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, format_uptime, is_expired_unix,
};

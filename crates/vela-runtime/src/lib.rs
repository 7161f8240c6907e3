//! Runtime wiring for the Vela engine: the reminder scheduler, the bot
//! membership lifecycle, the owner command surface, startup reconciliation,
//! and the single event-processing loop.

pub mod runtime_commands;
pub mod runtime_events;
pub mod runtime_membership;
pub mod runtime_scheduler;

pub use runtime_commands::{CommandConfig, CommandRouter};
pub use runtime_events::{EngineEvent, EngineRuntime, RuntimeConfig};
pub use runtime_membership::{MembershipCoordinator, ReminderPolicy};
pub use runtime_scheduler::{JobKey, JobKind, JobPayload, ReminderScheduler};

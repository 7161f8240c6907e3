//! Moderation core: permission caching with reconciliation, link detection,
//! and spam escalation.
//!
//! The caches here are owned service objects injected into the components
//! that need them. All mutation happens on the event-loop task; persistence
//! goes through the fire-and-forget store writer so the synchronous decision
//! path never blocks on disk.

pub mod moderation_link_filter;
pub mod moderation_permission_cache;
pub mod moderation_pipeline;
pub mod moderation_spam;

pub use moderation_link_filter::detect_link;
pub use moderation_permission_cache::{
    BotAuthorization, PermissionCache, PermissionCacheConfig,
};
pub use moderation_pipeline::{
    ModerationOutcome, ModerationPipeline, ModerationPolicy, SkipReason,
};
pub use moderation_spam::{SpamLedger, SpamPolicy, SpamVerdict};

//! Broadcast fan-out for the Vela engine.
//!
//! Delivers one piece of content (text and/or a single attachment) to the
//! recipient directory in bounded-concurrency batches, honoring platform
//! flood control, pruning dead recipients, and reporting live progress.

use thiserror::Error;

pub mod broadcast_dispatcher;
pub mod broadcast_progress;

pub use broadcast_dispatcher::{
    BroadcastConfig, BroadcastContent, BroadcastDispatcher, BroadcastReport, TargetSelector,
};
pub use broadcast_progress::{format_elapsed, render_progress};

/// Errors surfaced by the dispatcher's synchronous entry points.
#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast content is empty")]
    EmptyContent,
    #[error("no pending broadcast draft for operator {0}")]
    NoDraft(i64),
    #[error(transparent)]
    Store(#[from] vela_store::StoreError),
}

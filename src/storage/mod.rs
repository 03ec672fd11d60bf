//! Persistence boundary.
//!
//! The worker exposes exactly two storage surfaces to the rest of the
//! system: durable event/snapshot writes ([`EventStore`]) and a small
//! checkpoint/config key-value surface ([`StateStore`]). Everything else
//! (reporting, analytics, dashboards) lives outside this process.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::IngestedEvent;
use crate::stats::StreamStats;

pub use sqlite::{SqliteStore, init_pool, run_migrations};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage failures, split by blast radius.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store cannot be reached at all; the whole batch should be
    /// requeued and retried later.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The store rejected this one event; siblings in the same batch are
    /// unaffected.
    #[error("event rejected: {0}")]
    Rejected(String),
}

/// Outcome of merging one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Newly persisted.
    Inserted,
    /// Already present; merge is idempotent, so this is success.
    Skipped,
}

/// Durable event and snapshot writes.
///
/// `merge_event` must be safe to call twice for the same message id: the
/// worker's durability contract is at-least-once delivery with idempotent
/// merge, so backup replay and post-failure requeues re-submit events.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn merge_event(&self, event: &IngestedEvent, stream_id: &str)
        -> StoreResult<MergeOutcome>;

    async fn insert_snapshot(&self, stats: &StreamStats, stream_id: &str) -> StoreResult<()>;
}

/// Checkpoint/config key-value state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
}

/// Key under which the operator-controlled active target is stored.
pub const ACTIVE_TARGET_KEY: &str = "active_target";

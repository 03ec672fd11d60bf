//! Shared dependency bundle handed to the supervisor.

use std::sync::Arc;

use crate::backup::BackupStore;
use crate::config::WorkerConfig;
use crate::feed::ChatFeed;
use crate::stats::StatsSource;
use crate::storage::{EventStore, StateStore};

/// Everything the supervisor and its collectors need, behind trait objects
/// so tests can substitute scripted implementations.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub event_store: Arc<dyn EventStore>,
    pub state_store: Arc<dyn StateStore>,
    pub chat_feed: Arc<dyn ChatFeed>,
    pub stats_source: Arc<dyn StatsSource>,
    pub backups: Arc<BackupStore>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        event_store: Arc<dyn EventStore>,
        state_store: Arc<dyn StateStore>,
        chat_feed: Arc<dyn ChatFeed>,
        stats_source: Arc<dyn StatsSource>,
    ) -> Self {
        let backups = Arc::new(BackupStore::new(config.backup_dir.clone()));
        Self {
            config,
            event_store,
            state_store,
            chat_feed,
            stats_source,
            backups,
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .finish()
    }
}

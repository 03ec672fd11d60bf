//! Chat collection: turn the blocking pull feed into buffered, durable
//! storage writes, forever, with retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::buffer::{AppendOutcome, DurableBuffer};
use crate::config::WorkerConfig;
use crate::event::ParsedEvent;
use crate::feed::{ChatFeed, FeedConnection};
use crate::health::CollectorHealth;
use crate::retry::RetryPolicy;
use crate::storage::{EventStore, StoreError};
use crate::target::TargetDescriptor;
use crate::Result;

/// How often the collection loop re-checks the time-based flush condition.
const FLUSH_TICK: Duration = Duration::from_millis(500);

/// One chat-collection instance, bound to a single target.
///
/// The supervisor creates a fresh instance per target (and per watchdog
/// replacement); an instance is never rebound.
pub struct ChatCollector {
    target: TargetDescriptor,
    feed: Arc<dyn ChatFeed>,
    store: Arc<dyn EventStore>,
    backups: Arc<BackupStore>,
    buffer: Arc<DurableBuffer>,
    health: Arc<CollectorHealth>,
    retry: RetryPolicy,
    running: AtomicBool,
    cancel: CancellationToken,
    connection: Mutex<Option<Arc<dyn FeedConnection>>>,
}

impl ChatCollector {
    pub fn new(
        target: TargetDescriptor,
        feed: Arc<dyn ChatFeed>,
        store: Arc<dyn EventStore>,
        backups: Arc<BackupStore>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            target,
            feed,
            store,
            backups,
            buffer: Arc::new(DurableBuffer::new(
                config.buffer_size_threshold,
                config.flush_interval,
                config.overflow_factor,
            )),
            health: Arc::new(CollectorHealth::new()),
            retry: config.retry.clone(),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            connection: Mutex::new(None),
        }
    }

    pub fn health(&self) -> Arc<CollectorHealth> {
        Arc::clone(&self.health)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open the feed and collect until the stream ends, the collector is
    /// stopped, or the connection errors.
    pub async fn start_collection(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let connection: Arc<dyn FeedConnection> = Arc::from(self.feed.connect(&self.target).await?);
        *self.connection.lock() = Some(Arc::clone(&connection));
        info!(stream_id = %self.target.stream_id, "chat collection started");

        let result = self.collection_loop(&connection).await;

        *self.connection.lock() = None;
        // Nothing buffered may outlive the loop, success or not.
        if let Err(e) = self.flush_sync().await {
            warn!(stream_id = %self.target.stream_id, error = %e, "final flush failed");
        }
        result
    }

    async fn collection_loop(&self, connection: &Arc<dyn FeedConnection>) -> Result<()> {
        let mut flush_tick = tokio::time::interval(FLUSH_TICK);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if !self.is_running() {
                return Ok(());
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Ok(()),

                _ = flush_tick.tick() => {
                    if self.buffer.flush_due() {
                        self.flush_sync().await?;
                    }
                }

                item = connection.next() => match item? {
                    Some(raw) => self.handle_item(raw).await?,
                    None => {
                        info!(stream_id = %self.target.stream_id, "chat feed ended");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle_item(&self, raw: serde_json::Value) -> Result<()> {
        self.health.beat();
        match ParsedEvent::classify(raw) {
            ParsedEvent::Event(event) => {
                if self.buffer.append(event) == AppendOutcome::FlushDue {
                    self.flush_sync().await?;
                }
            }
            ParsedEvent::Unsupported { kind, raw } => {
                debug!(stream_id = %self.target.stream_id, kind, "filtered unsupported event");
                self.backups
                    .append_filtered(&self.target.stream_id, &kind, &raw)
                    .await?;
            }
        }
        Ok(())
    }

    /// Flush the buffer to storage with per-event isolation.
    ///
    /// The buffer is swapped under lock; the I/O happens after release, so
    /// producers never wait on storage. Rejected events go to a backup
    /// file; an unreachable store pushes the entire snapshot back to the
    /// buffer front, spilling overflow past the configured bound to disk.
    pub async fn flush_sync(&self) -> Result<()> {
        let snapshot = self.buffer.take_snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }
        let batch_size = snapshot.len();

        let mut rejected = Vec::new();
        for (i, event) in snapshot.iter().enumerate() {
            match self.store.merge_event(event, &self.target.stream_id).await {
                Ok(_) => {}
                Err(StoreError::Rejected(e)) => {
                    warn!(
                        stream_id = %self.target.stream_id,
                        id = %event.id,
                        error = %e,
                        "event rejected by store"
                    );
                    rejected.push(event.clone());
                }
                Err(StoreError::Unavailable(e)) => {
                    warn!(
                        stream_id = %self.target.stream_id,
                        error = %e,
                        batch_size,
                        failed_at = i,
                        "storage unreachable, requeueing batch"
                    );
                    let evicted = self.buffer.requeue_front(snapshot);
                    if !evicted.is_empty() {
                        warn!(
                            stream_id = %self.target.stream_id,
                            evicted = evicted.len(),
                            buffered = self.buffer.len(),
                            "buffer over bound, spilling oldest to backup"
                        );
                        self.backups
                            .write_backup(&self.target.stream_id, &evicted)
                            .await?;
                    }
                    return Ok(());
                }
            }
        }

        if !rejected.is_empty() {
            self.backups
                .write_backup(&self.target.stream_id, &rejected)
                .await?;
        }
        debug!(
            stream_id = %self.target.stream_id,
            flushed = batch_size - rejected.len(),
            rejected = rejected.len(),
            "flush complete"
        );
        Ok(())
    }

    /// Wrap [`start_collection`] in an exponential-backoff retry loop.
    ///
    /// A deliberate stop short-circuits further retries; shutdown
    /// cancellation propagates immediately.
    ///
    /// [`start_collection`]: ChatCollector::start_collection
    pub async fn collect_with_retry(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.start_collection().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !self.is_running() || self.cancel.is_cancelled() {
                        debug!(stream_id = %self.target.stream_id, "stopped during collection, not retrying");
                        return Ok(());
                    }
                    attempt += 1;
                    if !self.retry.should_retry(attempt) {
                        warn!(
                            stream_id = %self.target.stream_id,
                            attempt,
                            error = %e,
                            "chat collection retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        stream_id = %self.target.stream_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "chat collection failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if !self.is_running() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop collection: clear the running flag, force-close the feed
    /// connection so a blocked pull unblocks, and final-flush.
    pub async fn stop_collection(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }

        self.flush_sync().await
    }

    /// Drain whatever is still buffered straight to a backup file.
    ///
    /// Used by the supervisor when this collector's task had to be aborted
    /// and can no longer flush for itself.
    pub async fn spill_to_backup(&self) -> Result<()> {
        let remaining = self.buffer.take_snapshot();
        if remaining.is_empty() {
            return Ok(());
        }
        warn!(
            stream_id = %self.target.stream_id,
            events = remaining.len(),
            "spilling unflushed buffer to backup"
        );
        self.backups
            .write_backup(&self.target.stream_id, &remaining)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ChatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCollector")
            .field("target", &self.target)
            .field("running", &self.is_running())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::event::IngestedEvent;
    use crate::storage::{MergeOutcome, StoreResult};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            buffer_size_threshold: 3,
            flush_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                use_jitter: false,
            },
            ..Default::default()
        }
    }

    fn raw_event(id: &str) -> Value {
        json!({
            "id": id,
            "snippet": { "type": "textMessageEvent" },
            "authorDetails": { "channelId": "UC1" }
        })
    }

    /// Feed producing a scripted sequence, then end-of-stream.
    struct ScriptedFeed {
        items: parking_lot::Mutex<VecDeque<Value>>,
        connects: AtomicUsize,
        fail_first_connects: usize,
    }

    impl ScriptedFeed {
        fn new(items: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                items: parking_lot::Mutex::new(items.into()),
                connects: AtomicUsize::new(0),
                fail_first_connects: 0,
            })
        }
    }

    struct ScriptedConnection {
        feed: Arc<ScriptedFeed>,
        closed: CancellationToken,
    }

    #[async_trait]
    impl ChatFeed for Arc<ScriptedFeed> {
        async fn connect(&self, _target: &TargetDescriptor) -> Result<Box<dyn FeedConnection>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_connects {
                return Err(Error::feed("connect refused"));
            }
            Ok(Box::new(ScriptedConnection {
                feed: Arc::clone(self),
                closed: CancellationToken::new(),
            }))
        }
    }

    #[async_trait]
    impl FeedConnection for ScriptedConnection {
        async fn next(&self) -> Result<Option<Value>> {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            Ok(self.feed.items.lock().pop_front())
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    /// Store recording merges, scriptable to reject or be unavailable.
    #[derive(Default)]
    struct MemoryStore {
        merged: parking_lot::Mutex<Vec<String>>,
        unavailable: AtomicBool,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn merge_event(
            &self,
            event: &IngestedEvent,
            _stream_id: &str,
        ) -> StoreResult<MergeOutcome> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("offline".to_string()));
            }
            let mut merged = self.merged.lock();
            if merged.contains(&event.id) {
                Ok(MergeOutcome::Skipped)
            } else {
                merged.push(event.id.clone());
                Ok(MergeOutcome::Inserted)
            }
        }

        async fn insert_snapshot(
            &self,
            _stats: &crate::stats::StreamStats,
            _stream_id: &str,
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    fn collector(
        feed: Arc<ScriptedFeed>,
        store: Arc<MemoryStore>,
        backups: Arc<BackupStore>,
        config: &WorkerConfig,
    ) -> ChatCollector {
        ChatCollector::new(
            TargetDescriptor::new("stream1"),
            Arc::new(feed) as Arc<dyn ChatFeed>,
            store,
            backups,
            config,
        )
    }

    #[tokio::test]
    async fn test_collects_and_flushes_to_store() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new(vec![raw_event("a"), raw_event("b"), raw_event("c")]);
        let store = Arc::new(MemoryStore::default());
        let backups = Arc::new(BackupStore::new(tmp.path()));

        let collector = collector(feed, Arc::clone(&store), backups, &test_config());
        collector.start_collection().await.unwrap();

        let merged = store.merged.lock().clone();
        assert_eq!(merged, ["a", "b", "c"]);
        assert!(collector.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_events_go_to_filtered_log() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new(vec![
            raw_event("a"),
            json!({ "id": "x", "snippet": { "type": "messageDeletedEvent" } }),
        ]);
        let store = Arc::new(MemoryStore::default());
        let backups = Arc::new(BackupStore::new(tmp.path()));

        let collector = collector(feed, Arc::clone(&store), backups, &test_config());
        collector.start_collection().await.unwrap();

        assert_eq!(store.merged.lock().clone(), ["a"]);
        let filtered_exists = std::fs::read_dir(tmp.path().join("stream1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("filtered_messages_"));
        assert!(filtered_exists);
    }

    #[tokio::test]
    async fn test_unreachable_store_requeues_then_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new(vec![raw_event("a"), raw_event("b"), raw_event("c")]);
        let store = Arc::new(MemoryStore::default());
        store.unavailable.store(true, Ordering::SeqCst);
        let backups = Arc::new(BackupStore::new(tmp.path()));

        let collector = collector(feed, Arc::clone(&store), backups, &test_config());
        collector.start_collection().await.unwrap();

        // Nothing merged, everything requeued.
        assert!(store.merged.lock().is_empty());
        assert_eq!(collector.buffer.len(), 3);

        store.unavailable.store(false, Ordering::SeqCst);
        collector.flush_sync().await.unwrap();
        assert_eq!(store.merged.lock().clone(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_overflow_during_outage_spills_oldest_to_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = ScriptedFeed::new((b'a'..=b'f').map(|c| raw_event(&(c as char).to_string())).collect());
        let store = Arc::new(MemoryStore::default());
        store.unavailable.store(true, Ordering::SeqCst);
        let backups = Arc::new(BackupStore::new(tmp.path()));
        let mut config = test_config();
        config.buffer_size_threshold = 2;
        config.overflow_factor = 2;

        let collector = collector(feed, Arc::clone(&store), backups, &config);
        collector.start_collection().await.unwrap();

        // The buffer holds exactly the bound; the oldest events were
        // evicted to backup files instead of being dropped.
        assert!(store.merged.lock().is_empty());
        assert_eq!(collector.buffer.len(), 4);

        let mut spilled = Vec::new();
        for entry in std::fs::read_dir(tmp.path().join("stream1")).unwrap() {
            let entry = entry.unwrap();
            if !entry
                .file_name()
                .to_string_lossy()
                .starts_with("chat_buffer_backup_")
            {
                continue;
            }
            let body = std::fs::read_to_string(entry.path()).unwrap();
            let raw: Vec<Value> = serde_json::from_str(&body).unwrap();
            spilled.extend(raw.into_iter().map(|v| v["id"].as_str().unwrap().to_string()));
        }
        spilled.sort();
        assert_eq!(spilled, ["a", "b"]);

        // Recovery drains the survivors; the spilled events come back via
        // the startup import, so nothing was lost.
        store.unavailable.store(false, Ordering::SeqCst);
        collector.flush_sync().await.unwrap();
        assert_eq!(store.merged.lock().clone(), ["c", "d", "e", "f"]);
        collector.backups.import_all(store.as_ref()).await.unwrap();
        let mut merged = store.merged.lock().clone();
        merged.sort();
        assert_eq!(merged, ["a", "b", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn test_connect_failures_retry_then_exhaust() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed {
            items: parking_lot::Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            fail_first_connects: usize::MAX,
        });
        let store = Arc::new(MemoryStore::default());
        let backups = Arc::new(BackupStore::new(tmp.path()));
        let config = test_config();

        let collector = collector(Arc::clone(&feed), store, backups, &config);
        let result = collector.collect_with_retry().await;
        assert!(result.is_err());
        // Initial attempt plus one retry (max_attempts = 2 refuses attempt 2).
        assert_eq!(feed.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deliberate_stop_short_circuits_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed {
            items: parking_lot::Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
            fail_first_connects: usize::MAX,
        });
        let store = Arc::new(MemoryStore::default());
        let backups = Arc::new(BackupStore::new(tmp.path()));
        let mut config = test_config();
        config.retry.max_attempts = 100;
        config.retry.base_delay = Duration::from_secs(30);

        let collector = Arc::new(collector(Arc::clone(&feed), store, backups, &config));
        let task = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.collect_with_retry().await })
        };

        // Let it fail once and enter backoff, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.stop_collection().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("stop must interrupt backoff")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(feed.connects.load(Ordering::SeqCst), 1);
    }
}

//! Periodic stats polling: one snapshot per interval, persisted raw, with
//! lifecycle transitions surfaced to the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::health::CollectorHealth;
use crate::retry::RetryPolicy;
use crate::stats::{BroadcastStatus, StatsSource, StreamStats};
use crate::storage::EventStore;
use crate::target::TargetDescriptor;
use crate::Result;

/// Why a polling loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The endpoint reported the stream ended.
    StreamEnded,
    /// The collector was stopped or cancelled.
    Stopped,
}

/// Invoked with the new status whenever a poll observes a broadcast-status
/// transition. Not invoked for the first poll's baseline.
pub type StatusListener = Box<dyn Fn(BroadcastStatus) + Send + Sync>;

/// One stats-polling instance, bound to a single target.
pub struct StatsCollector {
    target: TargetDescriptor,
    source: Arc<dyn StatsSource>,
    store: Arc<dyn EventStore>,
    health: Arc<CollectorHealth>,
    retry: RetryPolicy,
    poll_interval: std::time::Duration,
    running: AtomicBool,
    cancel: CancellationToken,
    on_status: Option<StatusListener>,
}

impl StatsCollector {
    pub fn new(
        target: TargetDescriptor,
        source: Arc<dyn StatsSource>,
        store: Arc<dyn EventStore>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            target,
            source,
            store,
            health: Arc::new(CollectorHealth::new()),
            retry: config.retry.clone(),
            poll_interval: config.poll_interval,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_status: None,
        }
    }

    /// Register a status-transition listener.
    pub fn with_status_listener(
        mut self,
        listener: impl Fn(BroadcastStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_status = Some(Box::new(listener));
        self
    }

    pub fn health(&self) -> Arc<CollectorHealth> {
        Arc::clone(&self.health)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fetch one snapshot and persist it.
    ///
    /// The heartbeat fires on fetch success even when persistence fails:
    /// staleness means no upstream contact, not a storage outage.
    pub async fn collect_stats(&self) -> Result<StreamStats> {
        let stats = self.source.fetch(&self.target).await?;
        self.health.beat();

        if let Err(e) = self.store.insert_snapshot(&stats, &self.target.stream_id).await {
            warn!(
                stream_id = %self.target.stream_id,
                error = %e,
                "failed to persist stats snapshot"
            );
        }

        Ok(stats)
    }

    /// Poll until the stream ends, the collector is stopped, or consecutive
    /// fetch failures exhaust the configured retry attempts.
    ///
    /// Status transitions are detected against the previous successful
    /// snapshot; the first snapshot establishes a baseline without firing a
    /// transition.
    pub async fn start_polling(&self) -> Result<PollOutcome> {
        self.running.store(true, Ordering::SeqCst);
        info!(stream_id = %self.target.stream_id, "stats polling started");

        let mut previous: Option<BroadcastStatus> = None;
        let mut consecutive_failures: u32 = 0;

        loop {
            if !self.is_running() || self.cancel.is_cancelled() {
                return Ok(PollOutcome::Stopped);
            }

            match self.collect_stats().await {
                Ok(stats) => {
                    consecutive_failures = 0;
                    match previous {
                        Some(prev) if prev != stats.status => {
                            info!(
                                stream_id = %self.target.stream_id,
                                from = ?prev,
                                to = ?stats.status,
                                "broadcast status changed"
                            );
                            if let Some(listener) = &self.on_status {
                                listener(stats.status);
                            }
                        }
                        None => {
                            debug!(
                                stream_id = %self.target.stream_id,
                                status = ?stats.status,
                                "initial broadcast status"
                            );
                        }
                        _ => {}
                    }
                    previous = Some(stats.status);

                    if stats.stream_ended() {
                        info!(stream_id = %self.target.stream_id, "stream ended");
                        return Ok(PollOutcome::StreamEnded);
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if !self.retry.should_retry(consecutive_failures) {
                        warn!(
                            stream_id = %self.target.stream_id,
                            failures = consecutive_failures,
                            error = %e,
                            "stats polling retries exhausted"
                        );
                        return Err(e);
                    }
                    warn!(
                        stream_id = %self.target.stream_id,
                        failures = consecutive_failures,
                        error = %e,
                        "stats poll failed"
                    );
                }
            }

            let delay = if consecutive_failures > 0 {
                self.retry.delay_for_attempt(consecutive_failures)
            } else {
                self.poll_interval
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(PollOutcome::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Stop polling; an in-progress wait is interrupted.
    pub fn stop_polling(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsCollector")
            .field("target", &self.target)
            .field("running", &self.is_running())
            .finish()
    }
}

//! Collector supervision: session lifecycle, watchdog replacement of hung
//! collectors, operator retargeting, and graceful shutdown.
//!
//! The supervisor owns exactly one chat collector and one stats collector
//! at a time, each tracked in a slot with a generation number. Every
//! deliberate replacement bumps the generation first, so completion events
//! from a superseded collector arrive stale and are discarded instead of
//! driving the state machine twice.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{ChatCollector, PollOutcome, StatsCollector};
use crate::context::WorkerContext;
use crate::stats::BroadcastStatus;
use crate::storage::ACTIVE_TARGET_KEY;
use crate::target::TargetDescriptor;
use crate::Result;

/// Coarse lifecycle phase, readable by watchdogs and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Collectors not yet started.
    Initializing,
    /// Both collectors active against the current target.
    Running,
    /// Stream ended; holding the target warm in case it resumes or a
    /// retarget arrives.
    GracePeriod,
    /// Grace expired; waiting for a retarget.
    Idle,
}

/// Broadcast lifecycle of the current target, fed by status-change
/// notifications from the stats collector. Reset on every retarget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLifecycleState {
    /// Scheduled but not started; waiting-room chat is still collected.
    Upcoming,
    Live,
    Ended,
}

impl From<BroadcastStatus> for StreamLifecycleState {
    fn from(status: BroadcastStatus) -> Self {
        match status {
            BroadcastStatus::Upcoming => Self::Upcoming,
            BroadcastStatus::Live => Self::Live,
            BroadcastStatus::None => Self::Ended,
        }
    }
}

/// Notice from a collector task, tagged with the generation it was
/// spawned under.
enum SessionEvent {
    ChatFinished {
        generation: u64,
        result: Result<()>,
    },
    StatusChanged {
        generation: u64,
        status: BroadcastStatus,
    },
    StatsFinished {
        generation: u64,
        outcome: Result<PollOutcome>,
    },
}

struct ChatSlot {
    collector: Arc<ChatCollector>,
    handle: JoinHandle<()>,
    generation: u64,
}

struct StatsSlot {
    collector: Arc<StatsCollector>,
    handle: JoinHandle<()>,
    generation: u64,
}

/// Single-process supervisor for one chat collector and one stats
/// collector.
pub struct WorkerSupervisor {
    ctx: WorkerContext,
    target: parking_lot::RwLock<TargetDescriptor>,
    phase: parking_lot::Mutex<WorkerPhase>,
    /// None until the current session's stats polls observe a transition
    /// or the stream ends.
    lifecycle: parking_lot::Mutex<Option<StreamLifecycleState>>,
    /// Serializes every collector replacement. Watchdog swaps, retargets,
    /// respawns and shutdown all contend here, so at most one actor
    /// tears a collector down at a time.
    restart_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    retarget: Notify,
    chat_generation: AtomicU64,
    stats_generation: AtomicU64,
    chat_slot: tokio::sync::Mutex<Option<ChatSlot>>,
    stats_slot: tokio::sync::Mutex<Option<StatsSlot>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(ctx: WorkerContext, initial_target: TargetDescriptor) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ctx,
            target: parking_lot::RwLock::new(initial_target),
            phase: parking_lot::Mutex::new(WorkerPhase::Initializing),
            lifecycle: parking_lot::Mutex::new(None),
            restart_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            retarget: Notify::new(),
            chat_generation: AtomicU64::new(0),
            stats_generation: AtomicU64::new(0),
            chat_slot: tokio::sync::Mutex::new(None),
            stats_slot: tokio::sync::Mutex::new(None),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.lock()
    }

    pub fn lifecycle(&self) -> Option<StreamLifecycleState> {
        *self.lifecycle.lock()
    }

    pub fn current_target(&self) -> TargetDescriptor {
        self.target.read().clone()
    }

    /// Replace the active target and restart both collectors against it.
    ///
    /// Also wakes a grace-period or idle wait, so a retarget always takes
    /// effect regardless of the current phase.
    pub fn retarget(&self, target: TargetDescriptor) {
        {
            let mut current = self.target.write();
            if *current == target {
                return;
            }
            info!(from = %current, to = %target, "retargeting");
            *current = target;
        }
        self.retarget.notify_one();
    }

    /// Start the orchestrator, both watchdogs and the retarget monitor.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).orchestrate()));
        tasks.push(tokio::spawn(Arc::clone(self).chat_watchdog()));
        tasks.push(tokio::spawn(Arc::clone(self).stats_watchdog()));
        tasks.push(tokio::spawn(Arc::clone(self).retarget_monitor()));
    }

    /// Shut everything down: cancel the background tasks, stop both
    /// collectors with a final flush, and join with a bounded wait.
    pub async fn stop(&self) {
        info!("supervisor stopping");
        self.shutdown.cancel();

        {
            let _guard = self.restart_lock.lock().await;
            self.teardown_chat().await;
            self.teardown_stats().await;
            *self.phase.lock() = WorkerPhase::Idle;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(self.ctx.config.join_timeout, task)
                .await
                .is_err()
            {
                warn!("supervisor task did not stop within the join timeout");
            }
        }
        info!("supervisor stopped");
    }

    // ------------------------------------------------------------------
    // Orchestrator

    async fn orchestrate(self: Arc<Self>) {
        {
            let _guard = self.restart_lock.lock().await;
            self.spawn_chat().await;
            self.spawn_stats().await;
            *self.phase.lock() = WorkerPhase::Running;
        }

        let mut rx = self.events_rx.lock().await;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                _ = self.retarget.notified() => {
                    self.restart_session("retarget").await;
                }

                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::ChatFinished { generation, result } => {
                if generation != self.chat_generation.load(Ordering::SeqCst) {
                    debug!(generation, "ignoring completion of superseded chat collector");
                    return;
                }
                if self.phase() != WorkerPhase::Running {
                    return;
                }
                match result {
                    Ok(()) => {
                        // The feed closed while stats still says the stream
                        // is up. Reconnect after one poll interval; if the
                        // stream genuinely ended, the stats verdict arrives
                        // first and supersedes this respawn.
                        info!("chat feed closed while running, reconnecting");
                        self.delayed_respawn_chat().await;
                    }
                    Err(e) => {
                        error!(error = %e, "chat collection failed permanently, restarting collector");
                        self.delayed_respawn_chat().await;
                    }
                }
            }
            SessionEvent::StatusChanged { generation, status } => {
                if generation != self.stats_generation.load(Ordering::SeqCst) {
                    debug!(generation, "ignoring status change from superseded stats collector");
                    return;
                }
                let state = StreamLifecycleState::from(status);
                debug!(?state, "stream lifecycle updated");
                *self.lifecycle.lock() = Some(state);
            }
            SessionEvent::StatsFinished { generation, outcome } => {
                if generation != self.stats_generation.load(Ordering::SeqCst) {
                    debug!(generation, "ignoring completion of superseded stats collector");
                    return;
                }
                match outcome {
                    Ok(PollOutcome::StreamEnded) => self.enter_grace_period().await,
                    Ok(PollOutcome::Stopped) => {}
                    Err(e) => {
                        error!(error = %e, "stats polling failed permanently, restarting collector");
                        let delay = self.ctx.config.retry.base_delay;
                        if self.interruptible_sleep(delay).await {
                            return;
                        }
                        let _guard = self.restart_lock.lock().await;
                        if self.phase() == WorkerPhase::Running {
                            self.teardown_stats().await;
                            self.spawn_stats().await;
                        }
                    }
                }
            }
        }
    }

    /// Stream ended: stop stats polling but let chat collection run on
    /// through the grace window, catching trailing messages. A retarget
    /// cuts the window short; expiry stops chat and goes idle.
    async fn enter_grace_period(&self) {
        {
            let _guard = self.restart_lock.lock().await;
            if self.phase() != WorkerPhase::Running {
                return;
            }
            *self.phase.lock() = WorkerPhase::GracePeriod;
            *self.lifecycle.lock() = Some(StreamLifecycleState::Ended);
            self.teardown_stats().await;
        }
        info!(
            grace_secs = self.ctx.config.grace_period.as_secs(),
            "stream ended, entering grace period"
        );

        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,

            _ = self.retarget.notified() => {
                self.restart_session("retarget during grace period").await;
                return;
            }

            _ = tokio::time::sleep(self.ctx.config.grace_period) => {}
        }

        let _guard = self.restart_lock.lock().await;
        if self.shutdown.is_cancelled() || self.phase() != WorkerPhase::GracePeriod {
            return;
        }
        info!("grace period expired, going idle");
        self.teardown_chat().await;
        *self.phase.lock() = WorkerPhase::Idle;
    }

    async fn restart_session(&self, reason: &str) {
        let _guard = self.restart_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(reason, target = %self.current_target(), "restarting collection session");
        self.teardown_chat().await;
        self.teardown_stats().await;
        // The new target's lifecycle is unknown until its first transition.
        *self.lifecycle.lock() = None;
        self.spawn_chat().await;
        self.spawn_stats().await;
        *self.phase.lock() = WorkerPhase::Running;
    }

    async fn delayed_respawn_chat(&self) {
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => return,

            _ = self.retarget.notified() => {
                // Hand the permit back so the main loop performs the
                // retarget; a full session restart supersedes this respawn.
                self.retarget.notify_one();
                return;
            }

            _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
        }
        let _guard = self.restart_lock.lock().await;
        if self.phase() == WorkerPhase::Running {
            self.teardown_chat().await;
            self.spawn_chat().await;
        }
    }

    /// Sleep unless shutdown fires first; true means shutdown.
    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    // ------------------------------------------------------------------
    // Slot management. Callers hold the restart lock.

    async fn spawn_chat(&self) {
        let generation = self.chat_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let collector = Arc::new(ChatCollector::new(
            self.current_target(),
            Arc::clone(&self.ctx.chat_feed),
            Arc::clone(&self.ctx.event_store),
            Arc::clone(&self.ctx.backups),
            &self.ctx.config,
        ));
        let handle = {
            let collector = Arc::clone(&collector);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let result = collector.collect_with_retry().await;
                let _ = tx.send(SessionEvent::ChatFinished { generation, result });
            })
        };
        *self.chat_slot.lock().await = Some(ChatSlot {
            collector,
            handle,
            generation,
        });
        debug!(generation, "chat collector spawned");
    }

    async fn spawn_stats(&self) {
        let generation = self.stats_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let status_tx = self.events_tx.clone();
        let collector = Arc::new(
            StatsCollector::new(
                self.current_target(),
                Arc::clone(&self.ctx.stats_source),
                Arc::clone(&self.ctx.event_store),
                &self.ctx.config,
            )
            .with_status_listener(move |status| {
                let _ = status_tx.send(SessionEvent::StatusChanged { generation, status });
            }),
        );
        let handle = {
            let collector = Arc::clone(&collector);
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let outcome = collector.start_polling().await;
                let _ = tx.send(SessionEvent::StatsFinished { generation, outcome });
            })
        };
        *self.stats_slot.lock().await = Some(StatsSlot {
            collector,
            handle,
            generation,
        });
        debug!(generation, "stats collector spawned");
    }

    /// Stop and join the chat collector, aborting and spilling its buffer
    /// to backup if the task does not finish within the join timeout.
    async fn teardown_chat(&self) {
        // Superseded before the stop, so the completion event is stale.
        self.chat_generation.fetch_add(1, Ordering::SeqCst);
        let Some(mut slot) = self.chat_slot.lock().await.take() else {
            return;
        };
        if let Err(e) = slot.collector.stop_collection().await {
            warn!(error = %e, "chat collector stop failed");
        }
        if tokio::time::timeout(self.ctx.config.join_timeout, &mut slot.handle)
            .await
            .is_err()
        {
            warn!(
                generation = slot.generation,
                "chat collector hung on stop, aborting"
            );
            slot.handle.abort();
            // The abort lands at the task's next yield point; wait it out
            // so a straggling append cannot race the spill below.
            let _ = tokio::time::timeout(self.ctx.config.join_timeout, &mut slot.handle).await;
        }
        // Even a clean stop can leave events buffered when storage is
        // down; they must land in a backup file, not die with the slot.
        if let Err(e) = slot.collector.spill_to_backup().await {
            error!(error = %e, "failed to spill replaced collector's buffer");
        }
    }

    async fn teardown_stats(&self) {
        self.stats_generation.fetch_add(1, Ordering::SeqCst);
        let Some(mut slot) = self.stats_slot.lock().await.take() else {
            return;
        };
        slot.collector.stop_polling();
        if tokio::time::timeout(self.ctx.config.join_timeout, &mut slot.handle)
            .await
            .is_err()
        {
            warn!(
                generation = slot.generation,
                "stats collector hung on stop, aborting"
            );
            slot.handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Watchdogs

    async fn chat_watchdog(self: Arc<Self>) {
        let cfg = self.ctx.config.chat_watchdog.clone();
        loop {
            if self.interruptible_sleep(cfg.check_interval).await {
                return;
            }
            if self.phase() != WorkerPhase::Running {
                continue;
            }
            let stale = {
                let slot = self.chat_slot.lock().await;
                match slot.as_ref() {
                    Some(slot) => slot.collector.health().is_stale(cfg.timeout),
                    None => false,
                }
            };
            if !stale {
                continue;
            }

            let _guard = self.restart_lock.lock().await;
            if self.shutdown.is_cancelled() || self.phase() != WorkerPhase::Running {
                continue;
            }
            // Re-check under the lock: a swap that raced us resets health.
            let still_stale = {
                let slot = self.chat_slot.lock().await;
                slot.as_ref()
                    .map(|s| s.collector.health().is_stale(cfg.timeout))
                    .unwrap_or(false)
            };
            if !still_stale {
                continue;
            }
            warn!(
                timeout_secs = cfg.timeout.as_secs(),
                "chat collector stale, replacing"
            );
            self.teardown_chat().await;
            self.spawn_chat().await;
        }
    }

    async fn stats_watchdog(self: Arc<Self>) {
        let cfg = self.ctx.config.stats_watchdog.clone();
        loop {
            if self.interruptible_sleep(cfg.check_interval).await {
                return;
            }
            if self.phase() != WorkerPhase::Running {
                continue;
            }
            let stale = {
                let slot = self.stats_slot.lock().await;
                match slot.as_ref() {
                    Some(slot) => slot.collector.health().is_stale(cfg.timeout),
                    None => false,
                }
            };
            if !stale {
                continue;
            }

            let _guard = self.restart_lock.lock().await;
            if self.shutdown.is_cancelled() || self.phase() != WorkerPhase::Running {
                continue;
            }
            let still_stale = {
                let slot = self.stats_slot.lock().await;
                slot.as_ref()
                    .map(|s| s.collector.health().is_stale(cfg.timeout))
                    .unwrap_or(false)
            };
            if !still_stale {
                continue;
            }
            warn!(
                timeout_secs = cfg.timeout.as_secs(),
                "stats collector stale, replacing"
            );
            self.teardown_stats().await;
            self.spawn_stats().await;
        }
    }

    // ------------------------------------------------------------------
    // Retarget monitor

    /// Watch the operator-writable state key for a new target.
    async fn retarget_monitor(self: Arc<Self>) {
        loop {
            if self
                .interruptible_sleep(self.ctx.config.retarget_check_interval)
                .await
            {
                return;
            }
            match self.ctx.state_store.get(ACTIVE_TARGET_KEY).await {
                Ok(Some(raw)) => match TargetDescriptor::parse(&raw) {
                    Ok(target) => self.retarget(target),
                    Err(e) => {
                        warn!(raw, error = %e, "ignoring unparseable retarget request");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "retarget check failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("target", &self.current_target())
            .field("phase", &self.phase())
            .finish()
    }
}

//! Collector worker entry point.
//!
//! Wires configuration, storage, the upstream API clients and the
//! supervisor together, replays any backup files left by a previous run,
//! then collects until SIGINT/SIGTERM.

use std::sync::Arc;

use tracing::{info, warn};

use chatvault::config::AppConfig;
use chatvault::context::WorkerContext;
use chatvault::feed::YouTubeChatFeed;
use chatvault::logging::init_logging;
use chatvault::stats::YouTubeStatsSource;
use chatvault::storage::{
    ACTIVE_TARGET_KEY, EventStore, SqliteStore, StateStore, init_pool, run_migrations,
};
use chatvault::supervisor::WorkerSupervisor;
use chatvault::target::TargetDescriptor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let _log_guard = init_logging(&config.log_dir)?;
    info!(version = env!("CARGO_PKG_VERSION"), "chatvault starting");

    let pool = init_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let client = reqwest::Client::builder()
        .user_agent(concat!("chatvault/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let ctx = WorkerContext::new(
        config.worker.clone(),
        Arc::clone(&store) as Arc<dyn EventStore>,
        Arc::clone(&store) as Arc<dyn StateStore>,
        Arc::new(YouTubeChatFeed::new(client.clone(), config.api_key.clone())),
        Arc::new(YouTubeStatsSource::new(client, config.api_key.clone())),
    );

    // Replay backups from earlier runs before collecting anything new.
    if let Err(e) = ctx.backups.import_all(ctx.event_store.as_ref()).await {
        warn!(error = %e, "backup import failed, continuing");
    }

    // A target stored by the operator overrides the configured one.
    let target = match store.get(ACTIVE_TARGET_KEY).await {
        Ok(Some(raw)) => match TargetDescriptor::parse(&raw) {
            Ok(stored) => {
                info!(target = %stored, "resuming stored target");
                stored
            }
            Err(e) => {
                warn!(raw, error = %e, "stored target unparseable, using configured target");
                config.initial_target.clone()
            }
        },
        _ => config.initial_target.clone(),
    };

    let supervisor = WorkerSupervisor::new(ctx, target);
    supervisor.start();
    info!(target = %supervisor.current_target(), "collection started");

    wait_for_shutdown().await;
    supervisor.stop().await;
    info!("chatvault stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

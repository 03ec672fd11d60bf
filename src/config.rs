//! Environment-driven configuration.
//!
//! All worker tunables come from `CHATVAULT_*` environment variables
//! (optionally via a `.env` file). Missing required keys and unparseable
//! values are fatal at startup; every timing knob has a production default.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::target::TargetDescriptor;
use crate::{Error, Result};

/// Watchdog tunables for one collector kind.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Staleness threshold: idle longer than this triggers replacement.
    pub timeout: Duration,
    /// How often the watchdog checks the heartbeat.
    pub check_interval: Duration,
}

/// Tunables for the collector worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Buffer length at which a flush is signalled.
    pub buffer_size_threshold: usize,
    /// Maximum age of buffered events before a flush is signalled.
    pub flush_interval: Duration,
    /// Buffer hard cap as a multiple of `buffer_size_threshold`; excess is
    /// evicted to backup files.
    pub overflow_factor: usize,
    /// Root directory for backup files and the filtered side-channel.
    pub backup_dir: PathBuf,
    /// Stats poll interval.
    pub poll_interval: Duration,
    /// Chat collector watchdog.
    pub chat_watchdog: WatchdogConfig,
    /// Stats collector watchdog.
    pub stats_watchdog: WatchdogConfig,
    /// Backoff policy for chat collection retries.
    pub retry: RetryPolicy,
    /// How often the retarget monitor re-reads the stored target.
    pub retarget_check_interval: Duration,
    /// How long chat collection continues after stream end.
    pub grace_period: Duration,
    /// Bound on waiting for a collector task to stop during swap/shutdown.
    pub join_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            buffer_size_threshold: 50,
            flush_interval: Duration::from_secs(30),
            overflow_factor: 10,
            backup_dir: PathBuf::from("./chat_backups"),
            poll_interval: Duration::from_secs(60),
            chat_watchdog: WatchdogConfig {
                timeout: Duration::from_secs(300),
                check_interval: Duration::from_secs(30),
            },
            stats_watchdog: WatchdogConfig {
                timeout: Duration::from_secs(300),
                check_interval: Duration::from_secs(30),
            },
            retry: RetryPolicy::default(),
            retarget_check_interval: Duration::from_secs(15),
            grace_period: Duration::from_secs(120),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Upstream API key.
    pub api_key: String,
    /// Initial target stream (used until a stored target exists).
    pub initial_target: TargetDescriptor,
    /// Directory for log files.
    pub log_dir: PathBuf,
    /// Worker tunables.
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let database_url = env_or("CHATVAULT_DATABASE_URL", "sqlite:chatvault.db?mode=rwc");
        let api_key = required_env("CHATVAULT_API_KEY")?;
        let initial_target = TargetDescriptor::parse(&required_env("CHATVAULT_TARGET")?)?;
        let log_dir = PathBuf::from(env_or("CHATVAULT_LOG_DIR", "./logs"));

        let worker = WorkerConfig {
            buffer_size_threshold: parsed_env("CHATVAULT_BUFFER_SIZE_THRESHOLD", 50)?,
            flush_interval: secs_env("CHATVAULT_FLUSH_INTERVAL_SECS", 30)?,
            overflow_factor: parsed_env("CHATVAULT_OVERFLOW_FACTOR", 10)?,
            backup_dir: PathBuf::from(env_or("CHATVAULT_BACKUP_DIR", "./chat_backups")),
            poll_interval: secs_env("CHATVAULT_POLL_INTERVAL_SECS", 60)?,
            chat_watchdog: WatchdogConfig {
                timeout: secs_env("CHATVAULT_CHAT_WATCHDOG_TIMEOUT_SECS", 300)?,
                check_interval: secs_env("CHATVAULT_CHAT_WATCHDOG_CHECK_SECS", 30)?,
            },
            stats_watchdog: WatchdogConfig {
                timeout: secs_env("CHATVAULT_STATS_WATCHDOG_TIMEOUT_SECS", 300)?,
                check_interval: secs_env("CHATVAULT_STATS_WATCHDOG_CHECK_SECS", 30)?,
            },
            retry: RetryPolicy {
                max_attempts: parsed_env("CHATVAULT_RETRY_MAX_ATTEMPTS", 5)?,
                base_delay: secs_env("CHATVAULT_RETRY_BACKOFF_SECS", 2)?,
                ..RetryPolicy::default()
            },
            retarget_check_interval: secs_env("CHATVAULT_RETARGET_CHECK_SECS", 15)?,
            grace_period: secs_env("CHATVAULT_GRACE_PERIOD_SECS", 120)?,
            join_timeout: secs_env("CHATVAULT_JOIN_TIMEOUT_SECS", 10)?,
        };
        worker.validate()?;

        Ok(Self {
            database_url,
            api_key,
            initial_target,
            log_dir,
            worker,
        })
    }
}

impl WorkerConfig {
    /// Reject configurations that would disable core invariants.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size_threshold == 0 {
            return Err(Error::config("buffer size threshold must be nonzero"));
        }
        if self.overflow_factor < 2 {
            return Err(Error::config("overflow factor must be at least 2"));
        }
        if self.flush_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(Error::config("flush and poll intervals must be nonzero"));
        }
        if self.chat_watchdog.check_interval.is_zero()
            || self.stats_watchdog.check_interval.is_zero()
        {
            return Err(Error::config("watchdog check intervals must be nonzero"));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::config(format!("missing required env var {key}")))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parsed_env(key, default_secs)?))
}

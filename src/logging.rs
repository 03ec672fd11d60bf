//! Logging initialization.
//!
//! Console output plus a daily-rotated log file. The returned guard must be
//! kept alive for the process lifetime so buffered file writes are flushed.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "chatvault=info,sqlx=warn,reqwest=warn";

/// Initialize logging with console and rotating-file output.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| Error::io_path("creating log directory", log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "chatvault.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()
        .map_err(|e| Error::Other(format!("failed to set global subscriber: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_covers_crate() {
        assert!(DEFAULT_LOG_FILTER.contains("chatvault=info"));
        assert!(DEFAULT_LOG_FILTER.contains("sqlx=warn"));
    }
}

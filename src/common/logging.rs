//! Logging setup.
//!
//! CLI commands log to stderr. The daemon also appends to `monitor.log`.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Set to 1/true/yes to force debug logging
pub const DEBUG_ENV: &str = "CLAUDE_MONITOR_DEBUG";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn debug_requested(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true" | "TRUE" | "yes" | "YES"))
}

fn env_filter() -> EnvFilter {
    if debug_requested(env::var(DEBUG_ENV).ok().as_deref()) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn timer() -> ChronoLocal {
    ChronoLocal::new(TIMESTAMP_FORMAT.to_string())
}

/// Stderr-only logging for one-shot commands
pub fn init_cli() {
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_timer(timer())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Stderr plus append-only file logging for the daemon.
///
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_daemon(log_file: &Path) -> Result<WorkerGuard> {
    let dir = log_file
        .parent()
        .context("Log file path has no parent directory")?;
    let file_name = log_file
        .file_name()
        .context("Log file path has no file name")?;
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(
        dir, file_name,
    ));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_timer(timer())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .with(
            fmt::layer()
                .with_timer(timer())
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_requested_values() {
        assert!(debug_requested(Some("1")));
        assert!(debug_requested(Some("yes")));
        assert!(!debug_requested(Some("0")));
        assert!(!debug_requested(None));
    }
}

//! Logging setup
//!
//! JSON Lines logging to a daily-rolling file under `~/.canopy/logs/`
//! with a compact stderr layer, via tracing-subscriber.

use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::Result;

/// Log configuration
pub struct LogConfig {
    /// Directory the rolling JSON file is written to
    pub log_dir: PathBuf,
    /// Default filter when `RUST_LOG` is unset
    pub default_filter: String,
    /// Days of log files to retain
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            default_filter: "info".to_string(),
            retention_days: 7,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Returns the appender guard; the caller must keep it alive for the
/// process lifetime or buffered log lines are lost on exit.
pub fn init_logger(config: &LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, "canopy.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false);
    let stderr_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days)?;
    if removed > 0 {
        tracing::debug!(category = "logging", removed, "Removed expired log files");
    }

    Ok(guard)
}

/// Clean up rolled log files older than the retention window.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !is_log_file(&path) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified: chrono::DateTime<Utc> = modified.into();
                if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }

    Ok(removed)
}

/// Whether a path looks like a canopy rolled log file (canopy.jsonl.YYYY-MM-DD)
fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("canopy.jsonl"))
        .unwrap_or(false)
}

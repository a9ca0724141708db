//! Logging setup and log hygiene.
//!
//! The engine runs either as a systemd service (journald available) or
//! standalone next to the library service (rolling files). Ingest and
//! sync emit one line per photo at debug level, so the default filter
//! stays at `info` and silences ureq's per-request chatter; override
//! with `PHOTOSENSE_LOG`, e.g. `PHOTOSENSE_LOG=photosense::ingest=debug`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "PHOTOSENSE_LOG";
const LOG_FILE_PREFIX: &str = "photosense.log";

/// Keeps the non-blocking file writer flushing. Hold this for the
/// lifetime of the process; dropping it early loses buffered lines on
/// exit. Journald needs no flushing, so the guard may be empty.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info,ureq=warn"))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photosense")
        .join("logs")
}

/// Initialize tracing, preferring journald when the process runs under
/// systemd and falling back to daily-rolling files in `log_dir` (or the
/// platform data directory).
pub fn init(log_dir: Option<PathBuf>) -> Result<LogGuard> {
    #[cfg(target_os = "linux")]
    if let Ok(journald) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(journald)
            .init();
        tracing::info!("logging to journald");
        return Ok(LogGuard { _worker: None });
    }

    let dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;

    let (writer, worker) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    tracing::info!(dir = %dir.display(), "logging to rolling files");
    Ok(LogGuard {
        _worker: Some(worker),
    })
}

/// Sanitize an externally-provided identifier before it reaches a log
/// line: strip newlines and bound the length.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .take(64)
        .collect()
}

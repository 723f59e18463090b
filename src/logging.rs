//! Logging setup with optional file output and retention cleanup.
//!
//! The library logs through the `log` macros; the binary installs a
//! tracing subscriber here with console output and, when a log directory
//! is configured, a daily-rotated file keeping the last N days.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the global logging pipeline.
///
/// * `log_dir` - directory for rotated log files; `None` for console only
/// * `retention_days` - how many days of log files to keep
/// * `verbose` - raise the default level from info to debug
pub fn init_logging(
    log_dir: Option<&Path>,
    retention_days: u64,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = fmt::layer()
        .with_writer(io::stdout)
        .with_target(true)
        .with_timer(LocalTimeTimer);

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            clean_old_logs(dir, retention_days)?;
            let appender = tracing_appender::rolling::daily(dir, "dvbserve.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            // Keep the flush guard alive for the program lifetime.
            let _ = Box::leak(Box::new(Arc::new(guard)));
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .with_timer(LocalTimeTimer),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to set default subscriber: {e}"))?;

    // Bridge log:: macros into tracing.
    tracing_log::LogTracer::init().map_err(|e| format!("failed to initialize LogTracer: {e}"))?;

    Ok(())
}

/// Removes log files older than the retention window.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }
    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains("dvbserve.log"))
            .unwrap_or(false);
        if !is_ours {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified: chrono::DateTime<Local> = modified.into();
                if modified < cutoff {
                    if let Err(e) = fs::remove_file(&path) {
                        eprintln!("failed to remove old log file {path:?}: {e}");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Local-time timestamps in log lines.
#[derive(Debug, Clone, Copy)]
struct LocalTimeTimer;

impl fmt::time::FormatTime for LocalTimeTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}

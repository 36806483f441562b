//! Tracing setup for the server and the one-shot CLI.
//!
//! Request progress, retries, and provider failures are logged with `request_id` and `chunk`
//! fields. Those events go to stdout and to an append-only log file, so a run that was
//! streamed to a client can be reconstructed afterwards. The file path comes from
//! [`Config::log_file`](crate::config::Config::log_file) and defaults to
//! `logs/pdf-summarizer.log`.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILE: &str = "logs/pdf-summarizer.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the stdout and file layers. `RUST_LOG` overrides the `info` default.
///
/// When the log file cannot be opened the service keeps running with stdout only.
pub fn init_tracing(log_file: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    match open_log_file(&log_path(log_file)) {
        Some(writer) => {
            // Module targets let a request's pipeline and client events be told apart.
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

fn log_path(explicit: Option<&str>) -> PathBuf {
    match explicit.map(str::trim) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_LOG_FILE),
    }
}

/// Open `path` for appending behind a non-blocking writer, so chunk workers never wait on disk.
fn open_log_file(path: &Path) -> Option<NonBlocking> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());
    if let Err(err) = parent.map_or(Ok(()), std::fs::create_dir_all) {
        eprintln!("Failed to create log directory for {}: {err}", path.display());
        return None;
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let _ = LOG_GUARD.set(guard);
            Some(non_blocking)
        }
        Err(err) => {
            eprintln!("Failed to open log file {}: {err}", path.display());
            None
        }
    }
}

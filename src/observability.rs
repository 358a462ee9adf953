// SPDX-License-Identifier: BUSL-1.1

//! Logging and observability helpers.

pub mod sensitive;

pub use sensitive::{redact_url, Sensitive};

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "geofed.log";

/// Installs the global subscriber. Logs go to stderr unless a directory is
/// configured, in which case they go to a daily rolling file there.
///
/// Calling it twice is harmless; the second subscriber is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let writer = match &config.directory {
        Some(dir) => {
            let _ = fs::create_dir_all(dir);
            if let Err(e) = cleanup_old_logs(dir, config.retention_days) {
                eprintln!("Failed to clean up old logs: {}", e);
            }
            let appender: RollingFileAppender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            BoxMakeWriter::new(appender)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let ansi = config.directory.is_none() && !config.json;

    if config.json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .json()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .with_span_events(FmtSpan::CLOSE)
            .try_init();
    }

    install_panic_hook();

    tracing::debug!(
        json = config.json,
        directory = ?config.directory,
        "Tracing initialized"
    );
}

fn install_panic_hook() {
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("PANIC: {}", s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("PANIC: {}", s)
        } else {
            "PANIC: unknown cause".to_string()
        };

        tracing::error!(target: "panic", location = %location, message = %msg, "geofed panicked");

        previous_hook(panic_info);
    }));
}

/// Removes `geofed.log*` files older than `retention_days`.
fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if matches!(age, Some(age) if age > retention) {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("Failed to remove old log file {:?}: {}", path, e),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("geofed.log.2026-10-15"), "recent").unwrap();
        fs::write(dir.path().join("other.log"), "not ours").unwrap();

        let removed = cleanup_old_logs(dir.path(), 14).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn cleanup_with_zero_retention_removes_our_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("geofed.log.2026-01-01"), "old").unwrap();
        fs::write(dir.path().join("other.log"), "not ours").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let removed = cleanup_old_logs(dir.path(), 0).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("other.log").exists());
    }
}

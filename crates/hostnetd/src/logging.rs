//! Subscriber setup for the hostnetd binary
//!
//! Events go to stderr and, when a log directory is configured, to a dated
//! file `<dir>/<YYYY-MM-DD>_hostnetd.log` through a non-blocking writer, so
//! logging never waits on disk. `RUST_LOG` overrides the configured level.

use chrono::Local;
use hostnet_common::config::LoggingConfig;
use hostnet_common::{HostnetError, HostnetResult};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Name of the log file for today in `dir`.
pub fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("{}_hostnetd.log", Local::now().format("%Y-%m-%d")))
}

fn open_log_file(dir: &Path) -> HostnetResult<File> {
    fs::create_dir_all(dir).map_err(|e| HostnetError::io(dir, e))?;
    let path = log_file_path(dir);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| HostnetError::io(path, e))
}

/// Non-blocking writer over today's log file in `dir`. Buffered events are
/// flushed when the guard drops.
pub fn file_writer(dir: &Path) -> HostnetResult<(NonBlocking, WorkerGuard)> {
    Ok(tracing_appender::non_blocking(open_log_file(dir)?))
}

/// The filter in effect: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> HostnetResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| HostnetError::invalid_config("logging.level", e.to_string()))
}

/// Installs the global subscriber. Called once, by the binary.
pub fn init_logging(config: &LoggingConfig) -> HostnetResult<Option<WorkerGuard>> {
    let filter = env_filter(config)?;
    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            let (sink, guard) = file_writer(dir)?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(sink);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| HostnetError::invalid_state("logging", e.to_string()))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn test_log_file_path_is_dated() {
        let path = log_file_path(Path::new("/var/log/network"));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_hostnetd.log"));
        assert_eq!(name.len(), "YYYY-MM-DD_hostnetd.log".len());
        assert!(path.starts_with("/var/log/network"));
    }

    #[test]
    fn test_open_log_file_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("network");
        open_log_file(&nested).unwrap();
        assert!(log_file_path(&nested).exists());
    }

    #[test]
    fn test_file_writer_flushes_on_guard_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, guard) = file_writer(dir.path()).unwrap();

        let mut writer = sink.make_writer();
        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();
        drop(guard);

        let content = fs::read_to_string(log_file_path(dir.path())).unwrap();
        assert_eq!(content, "first line\nsecond line\n");
    }

    #[test]
    fn test_env_filter_rejects_garbage_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "hostnetd=verbose".to_string(),
            directory: None,
        };
        assert!(env_filter(&config).is_err());
    }
}

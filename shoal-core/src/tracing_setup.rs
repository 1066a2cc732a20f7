//! Tracing setup for Shoal
//!
//! Dual output: console logs at a caller-chosen level and a full trace
//! log on disk, so handshake drops and retries can be reconstructed
//! after the fact without making the console noisy.

use std::fmt;
use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt as subscriber_fmt};

use crate::config::{LoggingConfig, ShoalConfig, ThreadConfig};

/// Target every event of this crate is logged under.
const CRATE_TARGET: &str = "shoal_core";

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Could not create trace log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("A global subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Path of the per-run trace file for the thread named in `thread`.
///
/// Each net thread configuration gets its own file, so test runs and
/// production runs sharing a logs directory do not clobber each other.
pub fn log_file_path(logging: &LoggingConfig, thread: &ThreadConfig) -> PathBuf {
    logging
        .logs_dir
        .as_deref()
        .unwrap_or_else(|| Path::new("logs"))
        .join(format!("{}-last-run.log", thread.name))
}

/// Installs the global subscriber: console output at the configured level
/// and a full trace of this crate in [`log_file_path`].
///
/// `RUST_LOG` overrides the console filter. Both outputs carry thread
/// names, which is how events from the net thread are told apart from
/// the threads feeding it work.
///
/// Returns the trace file path.
///
/// # Errors
///
/// - `TracingError::LogFile` - If the logs directory or file cannot be created
/// - `TracingError::AlreadyInstalled` - If a global subscriber exists
pub fn init_tracing(
    logging: &LoggingConfig,
    thread: &ThreadConfig,
) -> Result<PathBuf, TracingError> {
    let path = log_file_path(logging, thread);
    let log_file = path
        .parent()
        .map_or(Ok(()), create_dir_all)
        .and_then(|()| File::create(&path))
        .map_err(|source| TracingError::LogFile {
            path: path.clone(),
            source,
        })?;

    let console_level = logging.console_level;
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{CRATE_TARGET}={console_level}")));

    let console_layer = subscriber_fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_filter(console_filter);

    let file_layer = subscriber_fmt::layer()
        .with_thread_names(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(format!("{CRATE_TARGET}=trace")));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        "Tracing initialized: console={console_level}, trace_file={}",
        path.display()
    );

    Ok(path)
}

impl ShoalConfig {
    /// Installs tracing for this configuration's logging and net thread.
    ///
    /// # Errors
    ///
    /// - `TracingError` - See [`init_tracing`]
    pub fn init_tracing(&self) -> Result<PathBuf, TracingError> {
        init_tracing(&self.logging, &self.thread)
    }
}

/// Console log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Debug, informational, warning, and error messages
    Debug,
    /// All messages including detailed tracing
    Trace,
}

impl LogLevel {
    /// Converts to the corresponding tracing Level.
    ///
    /// # Examples
    /// ```
    /// use shoal_core::tracing_setup::LogLevel;
    ///
    /// let level = LogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("trace".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
        assert_eq!(LogLevel::Error.as_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_log_file_named_after_thread() {
        let mut config = ShoalConfig::default();
        assert_eq!(
            log_file_path(&config.logging, &config.thread),
            Path::new("logs/shoal-net-last-run.log")
        );

        config.logging.logs_dir = Some(PathBuf::from("/var/log/shoal"));
        config.thread.name = "seed-box".to_string();
        assert_eq!(
            log_file_path(&config.logging, &config.thread),
            Path::new("/var/log/shoal/seed-box-last-run.log")
        );
    }

    // Only test in this binary that installs a global subscriber
    #[test]
    fn test_net_thread_events_reach_trace_file() {
        let logs_dir = tempfile::tempdir().unwrap();
        let mut config = ShoalConfig::for_testing();
        config.logging.logs_dir = Some(logs_dir.path().to_path_buf());
        config.thread.name = "shoal-trace-test".to_string();

        let path = config.init_tracing().unwrap();
        assert_eq!(path, logs_dir.path().join("shoal-trace-test-last-run.log"));

        let mut thread = crate::thread::NetThread::<()>::create(&config.thread).unwrap();
        thread.init_thread().unwrap();
        thread.start_thread(()).unwrap().stop_thread_wait().unwrap();

        let trace = std::fs::read_to_string(&path).unwrap();
        assert!(trace.contains("shoal-trace-test"));
        assert!(trace.contains("starting thread event loop"));

        assert!(matches!(
            config.init_tracing(),
            Err(TracingError::AlreadyInstalled(_))
        ));
    }
}

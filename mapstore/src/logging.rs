//! Logging bootstrap.
//!
//! The library itself only emits `tracing` events. Hosts that do not install
//! their own subscriber can call [`init_logging`]:
//!
//! ```ignore
//! use mapstore::logging::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(LoggingConfig::default().with_log_dir("/var/log/mapstore"))?;
//! ```
//!
//! The returned guard flushes the file writer when dropped, so keep it alive
//! for the lifetime of the process.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{StorageError, StorageResult};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "mapstore=info";

/// File name prefix for daily log files.
pub const LOG_FILE_PREFIX: &str = "mapstore.log";

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Directory for daily rotated log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Also log to stderr when a log directory is set.
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_string(),
            log_dir: None,
            stderr: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_stderr(mut self, stderr: bool) -> Self {
        self.stderr = stderr;
        self
    }

    fn env_filter(&self) -> StorageResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter).map_err(|e| {
                StorageError::InvalidConfig(format!(
                    "invalid log filter {}: {}",
                    self.default_filter, e
                ))
            }),
        }
    }
}

/// Install the global subscriber.
///
/// Returns the file writer guard when a log directory is configured.
pub fn init_logging(config: LoggingConfig) -> StorageResult<Option<WorkerGuard>> {
    let filter = config.env_filter()?;

    let stderr_layer = config.stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(LocalTime::rfc_3339())
            .with_target(false)
    });

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::disk(dir, e))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| StorageError::InvalidConfig(format!("logging already initialised: {}", e)))?;

    Ok(guard)
}

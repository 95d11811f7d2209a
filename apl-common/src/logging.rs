//! Tracing subscriber setup shared by the binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _guards = init_logging(&log_config)?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub target: LogTarget,
    /// When set, JSON lines are also appended to this file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Defaults overridden by `APL_LOG_LEVEL`, `APL_LOG_FORMAT` and `APL_LOG_FILE`.
    /// `RUST_LOG` still wins over the level when present.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("APL_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string());
        let format = match std::env::var("APL_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };
        let file = std::env::var("APL_LOG_FILE").ok().map(PathBuf::from);
        Self {
            level,
            format,
            target: LogTarget::Stdout,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.target = LogTarget::Stderr;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| LoggingError::Filter {
            filter: self.level.clone(),
            message: e.to_string(),
        })
    }
}

/// Keeps the non-blocking writers flushing. Drop at process exit.
#[must_use = "dropping the guards stops log output"]
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Later calls return empty guards.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = config.filter()?;
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(LoggingGuards { _guards: Vec::new() });
    }
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    let (writer, guard) = match config.target {
        LogTarget::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        LogTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };
    guards.push(guard);
    layers.push(match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(writer).boxed(),
        LogFormat::Pretty => fmt::layer().with_target(false).with_writer(writer).boxed(),
    });

    if let Some(path) = &config.file {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "apl.log".into());
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        layers.push(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuards { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_methods() {
        let cfg = LogConfig::from_env("info")
            .with_stderr()
            .with_level("debug")
            .with_format(LogFormat::Json)
            .with_file("/tmp/apl-logs/apl.log");
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.target, LogTarget::Stderr);
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.file, Some(PathBuf::from("/tmp/apl-logs/apl.log")));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let cfg = LogConfig {
            level: "apl_common=notalevel".to_string(),
            format: LogFormat::Pretty,
            target: LogTarget::Stderr,
            file: None,
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(cfg.filter(), Err(LoggingError::Filter { .. })));
        }
    }
}

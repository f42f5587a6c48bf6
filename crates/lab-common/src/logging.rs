//! Logging setup shared by the agent and orchestrator binaries.
//!
//! This module provides:
//! - An `EnvFilter` that can be swapped at runtime via `tracing_subscriber::reload`
//! - Console output in plain text or JSON with local timezone timestamps
//! - Optional daily-rolling file output through `tracing_appender`

use std::path::PathBuf;

use chrono::Local;
use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Errors raised while installing or reconfiguring logging.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid filter directive: {0}")]
    InvalidFilter(String),

    #[error("Failed to install subscriber: {0}")]
    Init(String),
}

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// What to install.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directive used when `RUST_LOG` is unset, e.g. `lab_agent=info`.
    pub default_filter: String,
    /// Explicit directive overriding both `RUST_LOG` and the default.
    pub filter_override: Option<String>,
    /// Emit JSON lines on the console instead of human-readable text.
    pub json: bool,
    /// Directory for daily-rolling log files; console only when `None`.
    pub log_dir: Option<PathBuf>,
    /// File name prefix for rolled files (`<prefix>.YYYY-MM-DD`).
    pub file_prefix: String,
}

impl LoggingOptions {
    pub fn new(default_filter: impl Into<String>, file_prefix: impl Into<String>) -> Self {
        Self {
            default_filter: default_filter.into(),
            filter_override: None,
            json: false,
            log_dir: None,
            file_prefix: file_prefix.into(),
        }
    }

    fn initial_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Some(directive) = &self.filter_override {
            return EnvFilter::try_new(directive)
                .map_err(|e| LoggingError::InvalidFilter(e.to_string()));
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter)))
    }
}

/// Handle kept by the application to adjust logging after startup.
pub struct LoggingHandle {
    handle: FilterHandle,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the active filter directive.
    pub fn set_filter(&self, directive: &str) -> Result<(), LoggingError> {
        let new_filter =
            EnvFilter::try_new(directive).map_err(|e| LoggingError::InvalidFilter(e.to_string()))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| LoggingError::Init(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

/// Install the global subscriber.
///
/// Keep the returned handle alive for the lifetime of the process; dropping it
/// flushes and stops the background file writer.
pub fn init(options: &LoggingOptions) -> Result<LoggingHandle, LoggingError> {
    let (filter_layer, filter_handle) = reload::Layer::new(options.initial_filter()?);

    let console = if options.json {
        fmt::layer().json().with_timer(LocalTimer).boxed()
    } else {
        fmt::layer().with_ansi(true).with_timer(LocalTimer).boxed()
    };

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingHandle {
        handle: filter_handle,
        _guard: guard,
    })
}

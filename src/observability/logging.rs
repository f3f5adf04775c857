//! Structured logging configuration.

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name, case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives, e.g. `info,lokal_resilience=debug`.
    pub directives: String,
    /// Optional file to append logs to instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            directives: DEFAULT_DIRECTIVES.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `LOKAL_LOG` | Filter directives (falls back to `RUST_LOG`) |
    /// | `LOKAL_LOG_FORMAT` | `json` or `pretty` |
    /// | `LOKAL_LOG_FILE` | Append logs to this file |
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(directives) = non_empty_env("LOKAL_LOG").or_else(|| non_empty_env("RUST_LOG")) {
            config.directives = directives;
        }
        if let Some(format) = non_empty_env("LOKAL_LOG_FORMAT").and_then(|v| LogFormat::parse(&v)) {
            config.format = format;
        }
        config.file = non_empty_env("LOKAL_LOG_FILE").map(PathBuf::from);
        config
    }

    /// Builds the subscriber filter from the configured directives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the directives do not parse.
    pub fn filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.directives)
            .map_err(|e| Error::Configuration(format!("invalid log filter '{}': {e}", self.directives)))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Thread-safe file writer for logging.
#[derive(Clone)]
pub(super) struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| io::Error::other(e.to_string()))?;
        guard.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Opens a log file for appending, creating parent directories.
pub(super) fn open_log_file(path: &Path) -> Result<LogFileWriter> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
            operation: "create_log_dir".to_string(),
            cause: e.to_string(),
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::OperationFailed {
            operation: "open_log_file".to_string(),
            cause: format!("{}: {}", path.display(), e),
        })?;

    Ok(LogFileWriter {
        file: Arc::new(Mutex::new(file)),
    })
}

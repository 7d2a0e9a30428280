//! Logging Setup
//!
//! Structured logging with configurable level and format (compact, pretty or
//! JSON). Logs go to stderr, or to a file when one is configured, so that
//! reports printed on stdout stay clean.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human-readable output
    #[default]
    Compact,
    /// Multi-line human-readable output
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" | "plain" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,

    /// Log span open/close events (shows per-scenario timing)
    pub span_events: bool,

    /// Include file and line number in logs
    pub file_and_line: bool,

    /// Log file path (logs to stderr if not set)
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            span_events: false,
            file_and_line: false,
            file_path: None,
        }
    }
}

impl LoggingConfig {
    /// Build from the `[logging]` section; `verbose` forces debug level
    pub fn from_config(section: &config::LoggingConfig, verbose: bool) -> Result<Self> {
        let level = if verbose {
            LogLevel::Debug
        } else {
            section.level.parse().map_err(anyhow::Error::msg)?
        };
        let format = section.format.parse().map_err(anyhow::Error::msg)?;
        let file_path = if section.log_to_file {
            section.log_file.as_ref().map(PathBuf::from)
        } else {
            None
        };

        Ok(Self {
            level,
            format,
            span_events: verbose,
            file_and_line: verbose,
            file_path,
        })
    }

    /// Initialize the global subscriber; `RUST_LOG` overrides the level
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()));

        let writer = match &self.file_path {
            Some(path) => {
                let file = File::options()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log file {:?}", path))?;
                BoxMakeWriter::new(Mutex::new(file))
            }
            None => BoxMakeWriter::new(std::io::stderr),
        };

        let base = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.file_path.is_none())
            .with_file(self.file_and_line)
            .with_line_number(self.file_and_line)
            .with_target(true)
            .with_span_events(if self.span_events {
                FmtSpan::NEW | FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            });

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            LogFormat::Compact => base.compact().with_filter(filter).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
            LogFormat::Json => base
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_filter(filter)
                .boxed(),
        };

        tracing_subscriber::registry().with(layer).try_init()?;

        tracing::debug!(
            "Logging initialized: level={}, format={:?}",
            self.level,
            self.format
        );
        Ok(())
    }
}

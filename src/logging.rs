//! Structured logging setup.
//!
//! The library only emits `tracing` events; binaries and tests decide where
//! they go. [`init_logging`] installs a `tracing-subscriber` registry with an
//! `EnvFilter` and a formatter on stderr:
//!
//! - `RUST_LOG` wins when set (full directive syntax)
//! - otherwise `TRUENO_AB_LOG` sets the crate level
//! - otherwise the configured level applies
//!
//! `TRUENO_AB_LOG_FORMAT=json` switches to JSON lines for log shippers.

use std::fmt;
use std::io::IsTerminal;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use crate::{Error, Result};

/// Environment variable holding the crate log level.
pub const LOG_LEVEL_ENV: &str = "TRUENO_AB_LOG";
/// Environment variable holding the output format.
pub const LOG_FORMAT_ENV: &str = "TRUENO_AB_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console lines.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(Self::Human),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(Error::Configuration(format!("unknown log format: {other}"))),
        }
    }
}

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Everything.
    Trace,
    /// Per-event diagnostics.
    Debug,
    /// Lifecycle transitions and decisions.
    #[default]
    Info,
    /// Degraded paths (storage fallbacks, timeouts).
    Warn,
    /// Failures only.
    Error,
    /// Silent.
    Off,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "off" | "none" => Ok(Self::Off),
            other => Err(Error::Configuration(format!("unknown log level: {other}"))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for this crate when `RUST_LOG` is unset
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Prefix human lines with timestamps
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Human,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Defaults overlaid with `TRUENO_AB_LOG` and `TRUENO_AB_LOG_FORMAT`.
    ///
    /// # Errors
    ///
    /// `Configuration` for unparseable values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            config.level = level.parse()?;
        }
        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        Ok(config)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("trueno_ab={}", self.level)))
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// `Configuration` if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = match config.format {
        LogFormat::Human => {
            let layer = tracing_fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            if config.timestamps {
                registry.with(layer).try_init()
            } else {
                registry.with(layer.without_time()).try_init()
            }
        }
        LogFormat::Json => registry
            .with(tracing_fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| Error::Configuration(format!("logging already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels_and_formats() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("jsonl".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Human);
        assert_eq!(config.level.to_string(), "info");
    }

    #[test]
    fn test_second_init_reports_error() {
        let config = LogConfig {
            level: LogLevel::Off,
            ..LogConfig::default()
        };
        // The first call may race with other tests; the second always fails.
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}

//! Engine configuration
//!
//! Defaults, then an optional JSON file, then `TRUENO_AB_*` environment
//! variables. Every value is validated before the engine is built; an
//! invalid configuration is an error, never silently replaced.
//!
//! | variable                          | field                        |
//! |-----------------------------------|------------------------------|
//! | `TRUENO_AB_ANALYSIS_TIMEOUT_MS`   | `analysis_timeout_ms`        |
//! | `TRUENO_AB_EVALUATION_INTERVAL_MS`| `evaluation_interval_ms`     |
//! | `TRUENO_AB_NOTIFICATION_CAPACITY` | `notification_capacity`      |
//! | `TRUENO_AB_SPENDING`              | `analysis.spending`          |
//! | `TRUENO_AB_GRID_POINTS`           | `analysis.grid_points`       |
//! | `TRUENO_AB_LOG`                   | `log.level`                  |
//! | `TRUENO_AB_LOG_FORMAT`            | `log.format`                 |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisSettings;
use crate::logging::{LogConfig, LOG_FORMAT_ENV, LOG_LEVEL_ENV};
use crate::scheduler::SchedulerConfig;
use crate::stats::SpendingFunction;
use crate::{Error, Result};

const ENV_TIMEOUT: &str = "TRUENO_AB_ANALYSIS_TIMEOUT_MS";
const ENV_INTERVAL: &str = "TRUENO_AB_EVALUATION_INTERVAL_MS";
const ENV_CAPACITY: &str = "TRUENO_AB_NOTIFICATION_CAPACITY";
const ENV_SPENDING: &str = "TRUENO_AB_SPENDING";
const ENV_GRID: &str = "TRUENO_AB_GRID_POINTS";

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sequential design and prior
    pub analysis: AnalysisSettings,
    /// Budget for one analysis/decision run
    pub analysis_timeout_ms: u64,
    /// Period of the scheduler sweep
    pub evaluation_interval_ms: u64,
    /// Capacity of the snapshot notification channel
    pub notification_capacity: usize,
    /// Logging
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisSettings::default(),
            analysis_timeout_ms: 30_000,
            evaluation_interval_ms: 60_000,
            notification_capacity: 1024,
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the environment.
    ///
    /// # Errors
    ///
    /// `Configuration` for unparseable or invalid values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON file, then overlay the environment.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Serialization` for bad JSON,
    /// `Configuration` for invalid values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&text)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON without consulting the environment.
    ///
    /// # Errors
    ///
    /// `Serialization` for bad JSON, `Configuration` for invalid values.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_TIMEOUT) {
            self.analysis_timeout_ms = parse_var(ENV_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_INTERVAL) {
            self.evaluation_interval_ms = parse_var(ENV_INTERVAL, &v)?;
        }
        if let Some(v) = lookup(ENV_CAPACITY) {
            self.notification_capacity = parse_var(ENV_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_GRID) {
            self.analysis.grid_points = parse_var(ENV_GRID, &v)?;
        }
        if let Some(v) = lookup(ENV_SPENDING) {
            self.analysis.spending = match v.to_ascii_lowercase().as_str() {
                "obrien_fleming" | "obf" => SpendingFunction::OBrienFleming,
                "pocock" => SpendingFunction::Pocock,
                other => {
                    return Err(Error::Configuration(format!(
                        "{ENV_SPENDING}: unknown spending function '{other}'"
                    )))
                }
            };
        }
        if let Some(v) = lookup(LOG_LEVEL_ENV) {
            self.log.level = v.parse()?;
        }
        if let Some(v) = lookup(LOG_FORMAT_ENV) {
            self.log.format = v.parse()?;
        }
        Ok(())
    }

    /// Check ranges.
    ///
    /// # Errors
    ///
    /// `Configuration` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.analysis_timeout_ms == 0 {
            return Err(Error::Configuration("analysis_timeout_ms must be positive".to_string()));
        }
        if self.evaluation_interval_ms == 0 {
            return Err(Error::Configuration(
                "evaluation_interval_ms must be positive".to_string(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(Error::Configuration(
                "notification_capacity must be positive".to_string(),
            ));
        }
        if !(33..=65_537).contains(&self.analysis.grid_points) {
            return Err(Error::Configuration(format!(
                "analysis.grid_points must be in 33..=65537, got {}",
                self.analysis.grid_points
            )));
        }
        if self.analysis.history_limit == 0 {
            return Err(Error::Configuration(
                "analysis.history_limit must be positive".to_string(),
            ));
        }
        let prior = self.analysis.prior;
        if !(prior.alpha > 0.0 && prior.beta > 0.0 && prior.alpha.is_finite() && prior.beta.is_finite()) {
            return Err(Error::Configuration(format!(
                "analysis.prior must have positive parameters, got Beta({}, {})",
                prior.alpha, prior.beta
            )));
        }
        Ok(())
    }

    /// Analysis timeout as a `Duration`.
    #[must_use]
    pub const fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    /// Scheduler sweep period as a `Duration`.
    #[must_use]
    pub const fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    /// Scheduler timing derived from this configuration.
    #[must_use]
    pub const fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            analysis_timeout: self.analysis_timeout(),
            evaluation_interval: self.evaluation_interval(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Configuration(format!("{name}='{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogFormat, LogLevel};
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.analysis_timeout(), Duration::from_secs(30));
        assert_eq!(config.analysis.spending, SpendingFunction::OBrienFleming);
        assert_eq!(config.scheduler().evaluation_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(
            r#"{"analysis_timeout_ms": 500, "analysis": {"spending": "pocock"}}"#,
        )
        .unwrap();
        assert_eq!(config.analysis_timeout_ms, 500);
        assert_eq!(config.analysis.spending, SpendingFunction::Pocock);
        assert_eq!(config.analysis.grid_points, 257);
        assert_eq!(config.notification_capacity, 1024);
    }

    #[test]
    fn test_invalid_json_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"evaluation_interval_ms": 0}"#),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json(r#"{"analysis": {"history_limit": 0}}"#),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let mut config = EngineConfig::default();
        config
            .apply_env(env(&[
                (ENV_TIMEOUT, "1500"),
                (ENV_SPENDING, "Pocock"),
                (LOG_LEVEL_ENV, "debug"),
                (LOG_FORMAT_ENV, "json"),
            ]))
            .unwrap();
        assert_eq!(config.analysis_timeout_ms, 1500);
        assert_eq!(config.analysis.spending, SpendingFunction::Pocock);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_env_garbage_rejected() {
        let mut config = EngineConfig::default();
        assert!(config.apply_env(env(&[(ENV_CAPACITY, "lots")])).is_err());
        assert!(config.apply_env(env(&[(ENV_SPENDING, "haybittle")])).is_err());
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"notification_capacity": 16}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.notification_capacity, 16);
    }
}

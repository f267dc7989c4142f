//! Configuration loading and validation
//!
//! Every field has a default so a partial (or empty) TOML file is valid.
//! The numeric alerting policy (slow-response threshold, cost bands,
//! success-rate floor) lives here rather than being hard-coded.

use crate::error::ConfigError;
use crate::events::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Longest accepted interval or window, ten years in seconds
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Longest accepted performance window in days
pub const MAX_WINDOW_DAYS: u32 = 10 * 365;

fn chrono_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Top-level configuration of the monitoring engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub event_log: EventLogConfig,
    pub connections: ConnectionConfig,
    pub alerts: AlertConfig,
    pub usage: UsageConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Maximum number of retained entries
    pub capacity: usize,
    /// Entries below this level are skipped
    pub min_level: LogLevel,
    /// Entries at or above this level fire the notification callbacks
    pub notify_level: LogLevel,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            min_level: LogLevel::Debug,
            notify_level: LogLevel::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub inactive_threshold_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            inactive_threshold_secs: 300,
            check_interval_secs: 60,
        }
    }
}

impl ConnectionConfig {
    pub fn inactive_threshold(&self) -> chrono::Duration {
        chrono_seconds(self.inactive_threshold_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Number of most recent alerts retained
    pub history_limit: usize,
    /// Auto-resolve sweep period
    pub check_interval_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            check_interval_secs: 30,
        }
    }
}

impl AlertConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Buffered records before an inline flush
    pub buffer_capacity: usize,
    pub flush_interval_secs: u64,
    /// Responses slower than this raise a MEDIUM alert
    pub slow_response_ms: u64,
    /// Inputs larger than this raise a LOW alert
    pub large_input_threshold: u64,
    /// Fraction of the daily cost threshold that raises the "approaching" alert
    pub cost_warning_ratio: f64,
    /// Rolling success rate below this raises an alert
    pub min_success_rate: f64,
    /// Rolling average duration above this raises an alert
    pub max_avg_duration_ms: f64,
    /// Auto-resolve window for alerts raised by the usage monitor
    pub alert_auto_resolve_secs: u64,
    /// Days covered by the rolling performance query
    pub performance_window_days: u32,
    /// Daily cost limit per provider
    pub cost_thresholds: HashMap<String, f64>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            flush_interval_secs: 60,
            slow_response_ms: 10_000,
            large_input_threshold: 100_000,
            cost_warning_ratio: 0.8,
            min_success_rate: 0.8,
            max_avg_duration_ms: 5_000.0,
            alert_auto_resolve_secs: 1800,
            performance_window_days: 1,
            cost_thresholds: HashMap::new(),
        }
    }
}

impl UsageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn alert_auto_resolve(&self) -> chrono::Duration {
        chrono_seconds(self.alert_auto_resolve_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Length of every rolling sample window
    pub window_size: usize,
    pub sample_interval_secs: u64,
    pub basic_interval_secs: u64,
    pub detailed_interval_secs: u64,
    pub full_interval_secs: u64,
    pub cpu_alert_percent: f64,
    pub memory_alert_percent: f64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            window_size: 60,
            sample_interval_secs: 10,
            basic_interval_secs: 10,
            detailed_interval_secs: 60,
            full_interval_secs: 300,
            cpu_alert_percent: 90.0,
            memory_alert_percent: 90.0,
        }
    }
}

impl StatusConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn basic_interval(&self) -> Duration {
        Duration::from_secs(self.basic_interval_secs)
    }

    pub fn detailed_interval(&self) -> Duration {
        Duration::from_secs(self.detailed_interval_secs)
    }

    pub fn full_interval(&self) -> Duration {
        Duration::from_secs(self.full_interval_secs)
    }
}

impl MonitorConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(value: u64, name: &str) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
            Ok(())
        }

        fn bounded(value: u64, max: u64, name: &str) -> Result<(), ConfigError> {
            if value > max {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be at most {}, got {}",
                    name, max, value
                )));
            }
            Ok(())
        }

        for (name, secs) in [
            (
                "connections.inactive_threshold_secs",
                self.connections.inactive_threshold_secs,
            ),
            (
                "connections.check_interval_secs",
                self.connections.check_interval_secs,
            ),
            ("alerts.check_interval_secs", self.alerts.check_interval_secs),
            ("usage.flush_interval_secs", self.usage.flush_interval_secs),
            (
                "usage.alert_auto_resolve_secs",
                self.usage.alert_auto_resolve_secs,
            ),
            ("status.sample_interval_secs", self.status.sample_interval_secs),
            ("status.basic_interval_secs", self.status.basic_interval_secs),
            (
                "status.detailed_interval_secs",
                self.status.detailed_interval_secs,
            ),
            ("status.full_interval_secs", self.status.full_interval_secs),
        ] {
            bounded(secs, MAX_DURATION_SECS, name)?;
        }
        bounded(
            u64::from(self.usage.performance_window_days),
            u64::from(MAX_WINDOW_DAYS),
            "usage.performance_window_days",
        )?;

        if self.event_log.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_log.capacity must be greater than zero".to_string(),
            ));
        }
        if self.alerts.history_limit == 0 {
            return Err(ConfigError::ValidationError(
                "alerts.history_limit must be greater than zero".to_string(),
            ));
        }
        if self.usage.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "usage.buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.status.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "status.window_size must be greater than zero".to_string(),
            ));
        }

        positive(
            self.connections.inactive_threshold_secs,
            "connections.inactive_threshold_secs",
        )?;
        positive(
            self.connections.check_interval_secs,
            "connections.check_interval_secs",
        )?;
        positive(self.alerts.check_interval_secs, "alerts.check_interval_secs")?;
        positive(self.usage.flush_interval_secs, "usage.flush_interval_secs")?;
        positive(
            self.usage.performance_window_days as u64,
            "usage.performance_window_days",
        )?;
        positive(self.status.sample_interval_secs, "status.sample_interval_secs")?;
        positive(self.status.basic_interval_secs, "status.basic_interval_secs")?;
        positive(
            self.status.detailed_interval_secs,
            "status.detailed_interval_secs",
        )?;
        positive(self.status.full_interval_secs, "status.full_interval_secs")?;

        for (name, ratio) in [
            ("usage.cost_warning_ratio", self.usage.cost_warning_ratio),
            ("usage.min_success_rate", self.usage.min_success_rate),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }

        if let Some((provider, limit)) = self
            .usage
            .cost_thresholds
            .iter()
            .find(|(_, limit)| !limit.is_finite() || **limit < 0.0)
        {
            return Err(ConfigError::ValidationError(format!(
                "usage.cost_thresholds.{} must be a non-negative amount, got {}",
                provider, limit
            )));
        }

        Ok(())
    }
}

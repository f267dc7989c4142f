//! Core value types shared by every monitoring component
//!
//! This module defines the timestamps, levels, severities and the open
//! category/outcome vocabularies used by the event log, the connection
//! registry, the alert engine and the usage monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Free-form structured details attached to log entries, alerts and rule contexts
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Severity level of an event log entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Normal operation
    Info,
    /// Something operators should look at
    Warning,
    /// An operation failed
    Error,
    /// The system is in a degraded state
    Critical,
}

impl LogLevel {
    /// Matching level of the `log` facade used to mirror entries to stderr
    pub fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Error | LogLevel::Critical => log::Level::Error,
        }
    }

    /// All levels, lowest first
    pub fn all() -> [LogLevel; 5] {
        [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ]
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Severity of an alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Worth knowing, no action required
    Low,
    /// Needs attention soon
    Medium,
    /// Something is failing
    High,
    /// Requires immediate attention
    Critical,
}

impl Severity {
    /// All severities, lowest first
    pub fn all() -> [Severity; 4] {
        [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
    }

    /// Event log level used when auditing an alert of this severity
    pub fn log_level(self) -> LogLevel {
        match self {
            Severity::Low => LogLevel::Info,
            Severity::Medium => LogLevel::Warning,
            Severity::High => LogLevel::Error,
            Severity::Critical => LogLevel::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Operation category of a log entry or alert
///
/// Unknown categories are never rejected; they are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Connection,
    Request,
    Command,
    Trading,
    Usage,
    Cost,
    Performance,
    Resource,
    Alert,
    System,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Connection => "connection",
            Category::Request => "request",
            Category::Command => "command",
            Category::Trading => "trading",
            Category::Usage => "usage",
            Category::Cost => "cost",
            Category::Performance => "performance",
            Category::Resource => "resource",
            Category::Alert => "alert",
            Category::System => "system",
            Category::Other(text) => text,
        }
    }
}

impl From<&str> for Category {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "connection" => Category::Connection,
            "request" => Category::Request,
            "command" => Category::Command,
            "trading" => Category::Trading,
            "usage" => Category::Usage,
            "cost" => Category::Cost,
            "performance" => Category::Performance,
            "resource" => Category::Resource,
            "alert" => Category::Alert,
            "system" => Category::System,
            _ => Category::Other(value.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        Category::from(value.as_str())
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        match value {
            Category::Other(text) => text,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the operation a log entry describes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Rejected,
    Other(String),
}

impl Outcome {
    pub fn as_str(&self) -> &str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::Rejected => "rejected",
            Outcome::Other(text) => text,
        }
    }
}

impl From<&str> for Outcome {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "success" => Outcome::Success,
            "failure" => Outcome::Failure,
            "timeout" => Outcome::Timeout,
            "rejected" => Outcome::Rejected,
            _ => Outcome::Other(value.to_string()),
        }
    }
}

impl From<String> for Outcome {
    fn from(value: String) -> Self {
        Outcome::from(value.as_str())
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Other(text) => text,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a [`Details`] map from key/value pairs
///
/// ```
/// use opsmon::details;
///
/// let d = details! { "provider" => "alpha", "cost" => 1.5 };
/// assert_eq!(d["provider"], "alpha");
/// ```
#[macro_export]
macro_rules! details {
    () => { $crate::events::Details::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::events::Details::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

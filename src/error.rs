use thiserror::Error;

/// Errors surfaced by the durable usage repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Repository query failed: {0}")]
    QueryFailed(String),
}

/// Errors raised while evaluating an alert rule or rendering its message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("Context field '{0}' is missing")]
    MissingField(String),

    #[error("Context field '{field}' has unexpected type: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Malformed message template: {0}")]
    InvalidTemplate(String),

    #[error("Rule evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors from the monitoring service lifecycle
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Monitoring service is already running")]
    AlreadyRunning,

    #[error("Monitoring service is not running")]
    NotRunning,

    #[error("No tokio runtime available to spawn background tasks")]
    NoRuntime,

    #[error("Background task failed to join: {0}")]
    TaskJoin(String),
}

/// Shared value types for log entries, alerts and rule contexts
pub mod events;

/// Error types for the monitoring engine
pub mod error;

/// Configuration management
pub mod config;

/// Bounded structured event log
pub mod eventlog;

/// Client connection liveness tracking
pub mod connections;

/// Alert lifecycle store and rule engine
pub mod alerts;

/// Provider usage, cost and performance monitoring
pub mod usage;

/// Tiered status snapshots and resource sampling
pub mod status;

/// Composition root and background tasks
pub mod service;

mod callback;

// Re-export commonly used types
pub use error::{ConfigError, RepositoryError, RuleError, ServiceError};
pub use service::MonitorService;

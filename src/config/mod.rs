/// TOML configuration for every monitoring component
pub mod monitor_config;

pub use monitor_config::{
    AlertConfig, ConnectionConfig, EventLogConfig, MonitorConfig, StatusConfig, UsageConfig,
};

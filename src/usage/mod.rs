/// Usage records and incremental provider statistics
pub mod record;
/// Daily aggregate report
pub mod report;
/// Storage collaborator trait and in-memory implementation
pub mod repository;
/// Usage buffer, anomaly checks and background cycle
pub mod usage_monitor;

pub use record::{PerformanceStats, UsageRecord};
pub use report::DailyReport;
pub use repository::{MemoryUsageRepository, RepoFuture, UsageRepository};
pub use usage_monitor::{CycleSummary, UsageMonitor, USAGE_ALERT_SOURCE};

/// Bounded, queryable structured event log
pub mod event_log;

pub use event_log::{EventLog, LogEntry, LogListener, LogQuery};

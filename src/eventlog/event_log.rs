//! Bounded structured event log
//!
//! The EventLog keeps the most recent log entries in a fixed-capacity
//! rolling buffer, answers multi-criteria queries over them and notifies
//! subscribers about entries at or above a configurable level.

use crate::callback::run_isolated;
use crate::config::EventLogConfig;
use crate::events::{Category, Details, LogLevel, Outcome, Timestamp};
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError, RwLock};

/// Callback fired for entries at or above the notification level
pub type LogListener = Box<dyn Fn(&LogEntry) -> anyhow::Result<()> + Send + Sync>;

/// A single immutable structured log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub level: LogLevel,
    /// Client the entry concerns, if any
    pub client_id: Option<String>,
    pub category: Category,
    pub outcome: Outcome,
    pub details: Details,
    pub message: String,
}

/// Filters for [`EventLog::query`]; every field is optional
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Only entries at or after this instant
    pub since: Option<Timestamp>,
    /// Only entries at or before this instant
    pub until: Option<Timestamp>,
    /// Only entries at or above this level
    pub min_level: Option<LogLevel>,
    pub client_id: Option<String>,
    pub category: Option<Category>,
    pub outcome: Option<Outcome>,
    /// Keep at most this many of the newest matches
    pub limit: Option<usize>,
}

impl LogQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
            && self.min_level.map_or(true, |level| entry.level >= level)
            && self
                .client_id
                .as_ref()
                .map_or(true, |id| entry.client_id.as_ref() == Some(id))
            && self
                .category
                .as_ref()
                .map_or(true, |category| &entry.category == category)
            && self
                .outcome
                .as_ref()
                .map_or(true, |outcome| &entry.outcome == outcome)
    }
}

/// Append-bounded event log
///
/// Entries are stored oldest-first. Once `capacity` is exceeded the oldest
/// entries are evicted. Recording never fails.
pub struct EventLog {
    entries: Mutex<VecDeque<LogEntry>>,
    listeners: RwLock<Vec<LogListener>>,
    capacity: usize,
    min_level: LogLevel,
    notify_level: LogLevel,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::from_config(&EventLogConfig::default())
    }
}

impl EventLog {
    /// Create an event log with the given capacity, recording every level
    /// and notifying from `Warning` up
    pub fn new(capacity: usize) -> Self {
        Self::with_levels(capacity, LogLevel::Debug, LogLevel::Warning)
    }

    /// Create an event log with explicit minimum and notification levels
    pub fn with_levels(capacity: usize, min_level: LogLevel, notify_level: LogLevel) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            listeners: RwLock::new(Vec::new()),
            capacity,
            min_level,
            notify_level,
        }
    }

    pub fn from_config(config: &EventLogConfig) -> Self {
        Self::with_levels(config.capacity, config.min_level, config.notify_level)
    }

    /// Register a notification callback
    pub fn subscribe(&self, listener: LogListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Record an entry
    ///
    /// Returns `None` when `level` is below the configured minimum and the
    /// entry was skipped.
    pub fn record(
        &self,
        level: LogLevel,
        client_id: Option<&str>,
        category: Category,
        outcome: Outcome,
        details: Details,
        message: impl Into<String>,
    ) -> Option<LogEntry> {
        if level < self.min_level {
            return None;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            client_id: client_id.map(str::to_string),
            category,
            outcome,
            details,
            message: message.into(),
        };

        log::log!(
            target: "opsmon::events",
            entry.level.as_log_level(),
            "[{}/{}]{} {}",
            entry.category,
            entry.outcome,
            entry
                .client_id
                .as_ref()
                .map(|id| format!(" client={}", id))
                .unwrap_or_default(),
            entry.message
        );

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        if entry.level >= self.notify_level {
            self.notify(&entry);
        }

        Some(entry)
    }

    /// Record a system error with no client attached
    pub fn system_error(&self, message: impl Into<String>, details: Details) -> Option<LogEntry> {
        self.record(
            LogLevel::Error,
            None,
            Category::System,
            Outcome::Failure,
            details,
            message,
        )
    }

    /// Entries matching `query`, oldest first, keeping the newest `limit`
    pub fn query(&self, query: &LogQuery) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<LogEntry> = entries
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();

        if let Some(limit) = query.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }

        matched
    }

    /// Number of retained entries per level
    pub fn level_counts(&self) -> HashMap<LogLevel, usize> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts = HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.level).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn notify(&self, entry: &LogEntry) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for (index, listener) in listeners.iter().enumerate() {
            if let Err(e) = run_isolated(|| listener(entry)) {
                // Reported through the facade only; recording it here could recurse
                warn!("Event log listener #{} failed: {}", index, e);
            }
        }
    }
}


// Property-based tests
#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    // After inserting capacity + k entries exactly capacity remain and the k oldest are gone
    #[quickcheck]
    fn prop_capacity_is_never_exceeded(capacity: u8, extra: u8) -> bool {
        let capacity = (capacity as usize % 50) + 1;
        let extra = extra as usize % 50;
        let log = EventLog::new(capacity);

        for i in 0..capacity + extra {
            log.record(
                LogLevel::Info,
                None,
                Category::System,
                Outcome::Success,
                Details::new(),
                i.to_string(),
            );
        }

        let entries = log.query(&LogQuery::default());
        entries.len() == capacity
            && entries
                .iter()
                .enumerate()
                .all(|(i, entry)| entry.message == (i + extra).to_string())
    }

    #[quickcheck]
    fn prop_limit_caps_result_size(count: u8, limit: u8) -> bool {
        let log = EventLog::new(300);
        for i in 0..count {
            log.record(
                LogLevel::Info,
                None,
                Category::System,
                Outcome::Success,
                Details::new(),
                i.to_string(),
            );
        }

        let entries = log.query(&LogQuery {
            limit: Some(limit as usize),
            ..Default::default()
        });
        entries.len() == (count as usize).min(limit as usize)
    }
}

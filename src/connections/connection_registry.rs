//! Client connection liveness tracking
//!
//! The ConnectionRegistry keeps one [`Connection`] per client id. Producer
//! calls mark activity; a periodic sweep flips connections that have been
//! silent for longer than the inactivity threshold to `Inactive`, audits the
//! transition in the event log and notifies the registered callbacks.

use crate::callback::run_isolated;
use crate::config::ConnectionConfig;
use crate::details;
use crate::eventlog::EventLog;
use crate::events::{Category, Details, LogLevel, Outcome, Timestamp};
use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Callback invoked once per ACTIVE -> INACTIVE transition
pub type InactivityCallback = Box<dyn Fn(&Connection) -> anyhow::Result<()> + Send + Sync>;

/// Liveness state of a client connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Disconnected,
}

/// Liveness record of one client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub client_id: String,
    pub connected_at: Timestamp,
    pub last_active: Timestamp,
    pub request_count: u64,
    pub command_count: u64,
    /// Longest observed gap between two activities, in milliseconds
    pub longest_idle_ms: i64,
    pub reconnect_count: u32,
    pub status: ConnectionStatus,
}

impl Connection {
    fn new(client_id: &str, now: Timestamp) -> Self {
        Self {
            client_id: client_id.to_string(),
            connected_at: now,
            last_active: now,
            request_count: 0,
            command_count: 0,
            longest_idle_ms: 0,
            reconnect_count: 0,
            status: ConnectionStatus::Active,
        }
    }

    /// Time since the last activity
    pub fn idle_for(&self, now: Timestamp) -> Duration {
        now - self.last_active
    }

    /// Mark activity at `now`; returns true when this was a reconnect
    fn touch(&mut self, now: Timestamp) -> bool {
        let gap = (now - self.last_active).num_milliseconds();
        self.longest_idle_ms = self.longest_idle_ms.max(gap);
        self.last_active = now;

        let reconnected = self.status == ConnectionStatus::Disconnected;
        if reconnected {
            self.reconnect_count += 1;
            self.connected_at = now;
        }
        self.status = ConnectionStatus::Active;
        reconnected
    }
}

/// Registry of client connections
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    callbacks: RwLock<Vec<InactivityCallback>>,
    event_log: Arc<EventLog>,
    inactive_threshold: Duration,
}

impl ConnectionRegistry {
    pub fn new(event_log: Arc<EventLog>, inactive_threshold: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            event_log,
            inactive_threshold,
        }
    }

    pub fn from_config(event_log: Arc<EventLog>, config: &ConnectionConfig) -> Self {
        Self::new(event_log, config.inactive_threshold())
    }

    pub fn inactive_threshold(&self) -> Duration {
        self.inactive_threshold
    }

    /// Register a callback for inactivity transitions
    pub fn on_inactive(&self, callback: InactivityCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Register a client, or refresh its liveness without counting a request
    pub fn register_or_touch(&self, client_id: &str) -> Connection {
        self.apply_activity(client_id, None)
    }

    /// Count a request (and optionally a command) for a client
    ///
    /// Unknown clients are registered on the fly. An inactive or
    /// disconnected client becomes active again; a disconnected one also
    /// has its reconnect counter incremented.
    pub fn record_activity(&self, client_id: &str, is_command: bool) -> Connection {
        self.apply_activity(client_id, Some(is_command))
    }

    fn apply_activity(&self, client_id: &str, request: Option<bool>) -> Connection {
        let now = Utc::now();
        let (connection, registered, reconnected) = {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let mut registered = false;
            let connection = connections
                .entry(client_id.to_string())
                .or_insert_with(|| {
                    registered = true;
                    Connection::new(client_id, now)
                });

            let reconnected = !registered && connection.touch(now);
            if let Some(is_command) = request {
                connection.request_count += 1;
                if is_command {
                    connection.command_count += 1;
                }
            }
            (connection.clone(), registered, reconnected)
        };

        if registered {
            self.audit(LogLevel::Info, &connection, "Client connected");
        } else if reconnected {
            self.audit(
                LogLevel::Info,
                &connection,
                format!(
                    "Client reconnected (reconnect #{})",
                    connection.reconnect_count
                ),
            );
        }

        connection
    }

    /// Mark a client as disconnected; returns false for unknown clients
    pub fn disconnect(&self, client_id: &str) -> bool {
        let connection = {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match connections.get_mut(client_id) {
                Some(connection) if connection.status != ConnectionStatus::Disconnected => {
                    connection.status = ConnectionStatus::Disconnected;
                    connection.clone()
                }
                Some(_) => return true,
                None => return false,
            }
        };

        self.audit(LogLevel::Info, &connection, "Client disconnected");
        true
    }

    pub fn get(&self, client_id: &str) -> Option<Connection> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    /// All connections, most recently active first
    pub fn list_all(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| {
            b.last_active
                .cmp(&a.last_active)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        all
    }

    pub fn active_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.status == ConnectionStatus::Active)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the inactivity sweep against the current time
    pub fn sweep_inactive(&self) -> Vec<Connection> {
        self.sweep_inactive_at(Utc::now())
    }

    /// Flip every ACTIVE connection idle for longer than the threshold at
    /// `now` to INACTIVE, returning the transitioned connections
    pub fn sweep_inactive_at(&self, now: Timestamp) -> Vec<Connection> {
        let transitioned: Vec<Connection> = {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            connections
                .values_mut()
                .filter(|c| {
                    c.status == ConnectionStatus::Active
                        && c.idle_for(now) > self.inactive_threshold
                })
                .map(|c| {
                    c.status = ConnectionStatus::Inactive;
                    c.clone()
                })
                .collect()
        };

        if transitioned.is_empty() {
            debug!("Inactivity sweep: no transitions");
            return transitioned;
        }

        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        for connection in &transitioned {
            let idle_seconds = connection.idle_for(now).num_seconds();
            self.event_log.record(
                LogLevel::Warning,
                Some(&connection.client_id),
                Category::Connection,
                Outcome::Timeout,
                details! {
                    "idle_seconds" => idle_seconds,
                    "threshold_seconds" => self.inactive_threshold.num_seconds(),
                },
                format!("Client inactive for {}s", idle_seconds),
            );

            for callback in callbacks.iter() {
                if let Err(e) = run_isolated(|| callback(connection)) {
                    self.event_log.system_error(
                        format!("Inactivity callback failed: {}", e),
                        details! { "client_id" => connection.client_id.clone() },
                    );
                }
            }
        }

        transitioned
    }

    fn audit(&self, level: LogLevel, connection: &Connection, message: impl Into<String>) {
        let mut details = Details::new();
        details.insert(
            "reconnect_count".to_string(),
            connection.reconnect_count.into(),
        );
        self.event_log.record(
            level,
            Some(&connection.client_id),
            Category::Connection,
            Outcome::Success,
            details,
            message,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::LogQuery;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> (ConnectionRegistry, Arc<EventLog>) {
        let log = Arc::new(EventLog::new(100));
        (
            ConnectionRegistry::new(Arc::clone(&log), Duration::minutes(5)),
            log,
        )
    }

    #[test]
    fn test_register_creates_active_connection() {
        let (registry, log) = registry();
        let connection = registry.register_or_touch("c1");

        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.request_count, 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_record_activity_counts_requests_and_commands() {
        let (registry, _) = registry();
        registry.record_activity("c1", false);
        registry.record_activity("c1", true);
        let connection = registry.record_activity("c1", true);

        assert_eq!(connection.request_count, 3);
        assert_eq!(connection.command_count, 2);
        assert_eq!(connection.reconnect_count, 0);
    }

    #[test]
    fn test_sweep_marks_idle_connection_inactive() {
        let (registry, log) = registry();
        let connection = registry.register_or_touch("c1");

        let before = registry.sweep_inactive_at(connection.last_active + Duration::minutes(5));
        assert!(before.is_empty(), "threshold must be exceeded, not just met");

        let after = registry
            .sweep_inactive_at(connection.last_active + Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(after.len(), 1);
        assert_eq!(
            registry.list_all()[0].status,
            ConnectionStatus::Inactive
        );

        let audits = log.query(&LogQuery {
            outcome: Some(Outcome::Timeout),
            ..Default::default()
        });
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].client_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (registry, _) = registry();
        let connection = registry.register_or_touch("c1");
        let later = connection.last_active + Duration::minutes(10);

        assert_eq!(registry.sweep_inactive_at(later).len(), 1);
        assert!(registry.sweep_inactive_at(later).is_empty());
    }

    #[test]
    fn test_activity_reactivates_inactive_without_reconnect() {
        let (registry, _) = registry();
        let connection = registry.register_or_touch("c1");
        registry.sweep_inactive_at(connection.last_active + Duration::minutes(10));

        let connection = registry.record_activity("c1", false);
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.reconnect_count, 0);
    }

    #[test]
    fn test_activity_after_disconnect_counts_one_reconnect() {
        let (registry, _) = registry();
        registry.register_or_touch("c1");
        assert!(registry.disconnect("c1"));
        assert_eq!(
            registry.get("c1").unwrap().status,
            ConnectionStatus::Disconnected
        );

        let connection = registry.record_activity("c1", true);
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.reconnect_count, 1);

        let connection = registry.record_activity("c1", true);
        assert_eq!(connection.reconnect_count, 1);
    }

    #[test]
    fn test_disconnected_connections_are_not_swept() {
        let (registry, _) = registry();
        let connection = registry.register_or_touch("c1");
        registry.disconnect("c1");

        let swept = registry.sweep_inactive_at(connection.last_active + Duration::hours(1));
        assert!(swept.is_empty());
        assert_eq!(
            registry.get("c1").unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_disconnect_unknown_client() {
        let (registry, _) = registry();
        assert!(!registry.disconnect("ghost"));
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_active_count_and_ordering() {
        let (registry, _) = registry();
        registry.register_or_touch("c1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.register_or_touch("c2");
        registry.register_or_touch("c3");
        registry.disconnect("c3");

        assert_eq!(registry.active_count(), 2);
        let all = registry.list_all();
        assert_eq!(all.len(), 3);
        assert_ne!(all[0].client_id, "c1");
        assert_eq!(all[2].client_id, "c1");
    }

    #[test]
    fn test_inactivity_callbacks_are_isolated() {
        let (registry, log) = registry();
        let fired = Arc::new(AtomicUsize::new(0));

        registry.on_inactive(Box::new(|_| Err(anyhow::anyhow!("rule engine down"))));
        registry.on_inactive(Box::new(|_| panic!("bad callback")));
        let counter = Arc::clone(&fired);
        registry.on_inactive(Box::new(move |connection| {
            assert_eq!(connection.status, ConnectionStatus::Inactive);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let c1 = registry.register_or_touch("c1");
        registry.register_or_touch("c2");
        let swept = registry.sweep_inactive_at(c1.last_active + Duration::minutes(6));

        assert_eq!(swept.len(), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let errors = log.query(&LogQuery {
            category: Some(Category::System),
            ..Default::default()
        });
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_longest_idle_gap_is_tracked() {
        let (registry, _) = registry();
        registry.register_or_touch("c1");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let connection = registry.record_activity("c1", false);

        assert!(connection.longest_idle_ms >= 20);
    }
}

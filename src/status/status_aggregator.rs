//! Tiered status snapshots
//!
//! The StatusAggregator keeps rolling windows of resource samples, response
//! times and per-minute request/command counts, and composes them with the
//! connection registry and the alert store into three views. Each tier
//! embeds the previous one, so a detailed snapshot serializes as a superset
//! of a basic one and a full snapshot as a superset of a detailed one.
//!
//! Views are composed from independent reads of each component and are not
//! a consistent cut across them.

use crate::alerts::{Alert, AlertManager};
use crate::config::StatusConfig;
use crate::connections::{Connection, ConnectionRegistry};
use crate::eventlog::EventLog;
use crate::events::{LogLevel, Severity, Timestamp};
use crate::status::sampler::{HostInfo, ResourceProbe, ResourceSample};
use chrono::{Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

const DETAILED_CONNECTIONS: usize = 10;
const DETAILED_ALERTS: usize = 20;
const FULL_ALERTS: usize = 100;

/// Overall health derived from the worst active alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Ok,
    Warning,
    Error,
    Critical,
}

impl OverallStatus {
    /// Map active alert counts per severity to a status
    pub fn from_alert_counts(counts: &BTreeMap<Severity, usize>) -> Self {
        let worst = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(severity, _)| *severity)
            .max();
        match worst {
            None => OverallStatus::Ok,
            Some(Severity::Low) | Some(Severity::Medium) => OverallStatus::Warning,
            Some(Severity::High) => OverallStatus::Error,
            Some(Severity::Critical) => OverallStatus::Critical,
        }
    }
}

/// Requests and commands counted during one minute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MinuteCounts {
    pub minute_end: Timestamp,
    pub requests: u64,
    pub commands: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicStatus {
    pub status: OverallStatus,
    pub timestamp: Timestamp,
    pub uptime_secs: i64,
    pub active_connections: usize,
    pub requests_last_minute: u64,
    pub commands_last_minute: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub avg_response_ms: f64,
    pub alert_counts: BTreeMap<Severity, usize>,
}

/// Averages over the sample windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowAverages {
    /// Share of successful operations; absent before the first result
    pub success_rate: Option<f64>,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub avg_requests_per_minute: f64,
    pub avg_commands_per_minute: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailedStatus {
    #[serde(flatten)]
    pub basic: BasicStatus,
    pub recent_connections: Vec<Connection>,
    pub recent_alerts: Vec<Alert>,
    pub averages: WindowAverages,
    pub total_requests: u64,
    pub total_commands: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullStatus {
    #[serde(flatten)]
    pub detailed: DetailedStatus,
    pub connections: Vec<Connection>,
    pub alerts: Vec<Alert>,
    pub resource_samples: Vec<ResourceSample>,
    pub response_times_ms: Vec<f64>,
    pub minute_counts: Vec<MinuteCounts>,
    pub log_levels: BTreeMap<LogLevel, usize>,
    pub host: HostInfo,
}

/// Rolling counters and tiered status views
pub struct StatusAggregator {
    started_at: Timestamp,
    window_size: usize,
    resources: Mutex<VecDeque<ResourceSample>>,
    response_times: Mutex<VecDeque<f64>>,
    minutes: Mutex<VecDeque<MinuteCounts>>,
    last_roll: Mutex<Timestamp>,
    // Counts for the minute in progress
    minute_requests: AtomicU64,
    minute_commands: AtomicU64,
    total_requests: AtomicU64,
    total_commands: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    probe: Box<dyn ResourceProbe>,
    host: HostInfo,
    connections: Arc<ConnectionRegistry>,
    alerts: Arc<AlertManager>,
    event_log: Arc<EventLog>,
    basic_tx: watch::Sender<Option<BasicStatus>>,
    detailed_tx: watch::Sender<Option<DetailedStatus>>,
    full_tx: watch::Sender<Option<FullStatus>>,
}

impl StatusAggregator {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        alerts: Arc<AlertManager>,
        event_log: Arc<EventLog>,
        probe: Box<dyn ResourceProbe>,
        config: &StatusConfig,
    ) -> Self {
        let now = Utc::now();
        let host = probe.host_info();
        Self {
            started_at: now,
            window_size: config.window_size,
            resources: Mutex::new(VecDeque::with_capacity(config.window_size)),
            response_times: Mutex::new(VecDeque::with_capacity(config.window_size)),
            minutes: Mutex::new(VecDeque::with_capacity(config.window_size)),
            last_roll: Mutex::new(now),
            minute_requests: AtomicU64::new(0),
            minute_commands: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_commands: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            probe,
            host,
            connections,
            alerts,
            event_log,
            basic_tx: watch::channel(None).0,
            detailed_tx: watch::channel(None).0,
            full_tx: watch::channel(None).0,
        }
    }

    pub fn record_request(&self) {
        self.minute_requests.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.minute_commands.fetch_add(1, Ordering::Relaxed);
        self.total_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, ms: f64) {
        push_capped(&self.response_times, ms, self.window_size);
    }

    pub fn record_operation_result(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take a resource sample and append it to the window
    pub fn sample_resources(&self) -> ResourceSample {
        let sample = self.probe.sample();
        push_capped(&self.resources, sample, self.window_size);
        sample
    }

    /// Close the current minute and start counting a new one
    pub fn roll_minute(&self) -> MinuteCounts {
        self.roll_minute_at(Utc::now())
    }

    pub fn roll_minute_at(&self, now: Timestamp) -> MinuteCounts {
        let counts = MinuteCounts {
            minute_end: now,
            requests: self.minute_requests.swap(0, Ordering::Relaxed),
            commands: self.minute_commands.swap(0, Ordering::Relaxed),
        };
        push_capped(&self.minutes, counts, self.window_size);
        *self.last_roll.lock().unwrap_or_else(PoisonError::into_inner) = now;
        debug!(
            "Minute closed: {} requests, {} commands",
            counts.requests, counts.commands
        );
        counts
    }

    /// Sample resources and close the minute once a minute has passed
    pub fn tick_at(&self, now: Timestamp) -> ResourceSample {
        let sample = self.sample_resources();
        let due = {
            let last_roll = self.last_roll.lock().unwrap_or_else(PoisonError::into_inner);
            now - *last_roll >= Duration::minutes(1)
        };
        if due {
            self.roll_minute_at(now);
        }
        sample
    }

    pub fn basic(&self) -> BasicStatus {
        self.basic_at(Utc::now())
    }

    pub fn basic_at(&self, now: Timestamp) -> BasicStatus {
        let alert_counts = self.alerts.counts_by_severity();
        let latest = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .copied();
        let (requests_last_minute, commands_last_minute) = self
            .minutes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .map(|m| (m.requests, m.commands))
            .unwrap_or_else(|| {
                (
                    self.minute_requests.load(Ordering::Relaxed),
                    self.minute_commands.load(Ordering::Relaxed),
                )
            });

        BasicStatus {
            status: OverallStatus::from_alert_counts(&alert_counts),
            timestamp: now,
            uptime_secs: (now - self.started_at).num_seconds().max(0),
            active_connections: self.connections.active_count(),
            requests_last_minute,
            commands_last_minute,
            cpu_percent: latest.map_or(0.0, |s| s.cpu_percent),
            memory_percent: latest.map_or(0.0, |s| s.memory_percent),
            avg_response_ms: mean(
                self.response_times
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .copied(),
            ),
            alert_counts,
        }
    }

    pub fn detailed(&self) -> DetailedStatus {
        self.detailed_at(Utc::now())
    }

    pub fn detailed_at(&self, now: Timestamp) -> DetailedStatus {
        let basic = self.basic_at(now);
        let mut recent_connections = self.connections.list_all();
        recent_connections.truncate(DETAILED_CONNECTIONS);

        DetailedStatus {
            basic,
            recent_connections,
            recent_alerts: self.alerts.recent(DETAILED_ALERTS),
            averages: self.averages(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_commands: self.total_commands.load(Ordering::Relaxed),
        }
    }

    pub fn full(&self) -> FullStatus {
        self.full_at(Utc::now())
    }

    pub fn full_at(&self, now: Timestamp) -> FullStatus {
        FullStatus {
            detailed: self.detailed_at(now),
            connections: self.connections.list_all(),
            alerts: self.alerts.recent(FULL_ALERTS),
            resource_samples: snapshot(&self.resources),
            response_times_ms: snapshot(&self.response_times),
            minute_counts: snapshot(&self.minutes),
            log_levels: self.event_log.level_counts().into_iter().collect(),
            host: self.host.clone(),
        }
    }

    fn averages(&self) -> WindowAverages {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let operations = successes + failures;

        let (avg_cpu_percent, avg_memory_percent) = {
            let resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
            (
                mean(resources.iter().map(|s| s.cpu_percent)),
                mean(resources.iter().map(|s| s.memory_percent)),
            )
        };
        let (avg_requests_per_minute, avg_commands_per_minute) = {
            let minutes = self.minutes.lock().unwrap_or_else(PoisonError::into_inner);
            (
                mean(minutes.iter().map(|m| m.requests as f64)),
                mean(minutes.iter().map(|m| m.commands as f64)),
            )
        };

        WindowAverages {
            success_rate: (operations > 0).then(|| successes as f64 / operations as f64),
            avg_cpu_percent,
            avg_memory_percent,
            avg_requests_per_minute,
            avg_commands_per_minute,
        }
    }

    pub fn subscribe_basic(&self) -> watch::Receiver<Option<BasicStatus>> {
        self.basic_tx.subscribe()
    }

    pub fn subscribe_detailed(&self) -> watch::Receiver<Option<DetailedStatus>> {
        self.detailed_tx.subscribe()
    }

    pub fn subscribe_full(&self) -> watch::Receiver<Option<FullStatus>> {
        self.full_tx.subscribe()
    }

    /// Compute the basic view and hand it to subscribers
    pub fn publish_basic(&self) -> BasicStatus {
        let view = self.basic();
        debug!("Publishing basic status: {:?}", view.status);
        self.basic_tx.send_replace(Some(view.clone()));
        view
    }

    pub fn publish_detailed(&self) -> DetailedStatus {
        let view = self.detailed();
        self.detailed_tx.send_replace(Some(view.clone()));
        view
    }

    pub fn publish_full(&self) -> FullStatus {
        let view = self.full();
        self.full_tx.send_replace(Some(view.clone()));
        view
    }
}

fn push_capped<T>(window: &Mutex<VecDeque<T>>, value: T, capacity: usize) {
    let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
    window.push_back(value);
    while window.len() > capacity {
        window.pop_front();
    }
}

fn snapshot<T: Clone>(window: &Mutex<VecDeque<T>>) -> Vec<T> {
    window
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertRequest;
    use crate::events::Category;
    use std::sync::atomic::AtomicU32;

    /// Probe returning a fixed load that rises by one percent per sample
    struct FakeProbe {
        calls: AtomicU32,
    }

    impl ResourceProbe for FakeProbe {
        fn sample(&self) -> ResourceSample {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            ResourceSample {
                timestamp: Utc::now(),
                cpu_percent: 10.0 + f64::from(n),
                memory_percent: 50.0,
                process_rss_bytes: 1024,
            }
        }

        fn host_info(&self) -> HostInfo {
            HostInfo {
                hostname: "test-host".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                cpu_count: 4,
                total_memory_bytes: 8 << 30,
                pid: 1,
            }
        }
    }

    struct Fixture {
        aggregator: StatusAggregator,
        connections: Arc<ConnectionRegistry>,
        alerts: Arc<AlertManager>,
    }

    fn fixture(window_size: usize) -> Fixture {
        let log = Arc::new(EventLog::new(1000));
        let connections = Arc::new(ConnectionRegistry::new(
            Arc::clone(&log),
            Duration::minutes(5),
        ));
        let alerts = Arc::new(AlertManager::new(Arc::clone(&log), 1000));
        let config = StatusConfig {
            window_size,
            ..Default::default()
        };
        let aggregator = StatusAggregator::new(
            Arc::clone(&connections),
            Arc::clone(&alerts),
            log,
            Box::new(FakeProbe {
                calls: AtomicU32::new(0),
            }),
            &config,
        );
        Fixture {
            aggregator,
            connections,
            alerts,
        }
    }

    fn alert(alerts: &AlertManager, severity: Severity) -> Alert {
        alerts.create_alert(AlertRequest::new(severity, Category::System, "test"))
    }

    #[test]
    fn test_status_ok_without_active_alerts() {
        let f = fixture(60);
        assert_eq!(f.aggregator.basic().status, OverallStatus::Ok);

        let resolved = alert(&f.alerts, Severity::Critical);
        f.alerts.resolve(resolved.id, "ops");
        assert_eq!(f.aggregator.basic().status, OverallStatus::Ok);
    }

    #[test]
    fn test_one_critical_alert_dominates() {
        let f = fixture(60);
        for _ in 0..5 {
            alert(&f.alerts, Severity::Low);
            alert(&f.alerts, Severity::High);
        }
        assert_eq!(f.aggregator.basic().status, OverallStatus::Error);

        let critical = alert(&f.alerts, Severity::Critical);
        let basic = f.aggregator.basic();
        assert_eq!(basic.status, OverallStatus::Critical);
        assert_eq!(basic.alert_counts[&Severity::Low], 5);
        assert_eq!(basic.alert_counts[&Severity::Critical], 1);

        f.alerts.acknowledge(critical.id, "ops");
        assert_eq!(f.aggregator.basic().status, OverallStatus::Critical);
    }

    #[test]
    fn test_status_mapping() {
        let mut counts: BTreeMap<Severity, usize> =
            Severity::all().into_iter().map(|s| (s, 0)).collect();
        assert_eq!(OverallStatus::from_alert_counts(&counts), OverallStatus::Ok);
        counts.insert(Severity::Medium, 2);
        assert_eq!(
            OverallStatus::from_alert_counts(&counts),
            OverallStatus::Warning
        );
    }

    #[test]
    fn test_counters_and_minute_roll() {
        let f = fixture(60);
        for _ in 0..3 {
            f.aggregator.record_request();
        }
        f.aggregator.record_command();

        let basic = f.aggregator.basic();
        assert_eq!(basic.requests_last_minute, 3);
        assert_eq!(basic.commands_last_minute, 1);

        let closed = f.aggregator.roll_minute();
        assert_eq!(closed.requests, 3);
        f.aggregator.record_request();

        let detailed = f.aggregator.detailed();
        assert_eq!(detailed.basic.requests_last_minute, 3);
        assert_eq!(detailed.total_requests, 4);
        assert_eq!(detailed.total_commands, 1);
        assert_eq!(detailed.averages.avg_requests_per_minute, 3.0);
    }

    #[test]
    fn test_tick_rolls_minute_when_due() {
        let f = fixture(60);
        f.aggregator.record_request();
        let start = Utc::now();

        f.aggregator.tick_at(start);
        assert!(f.aggregator.full().minute_counts.is_empty());

        f.aggregator.tick_at(start + Duration::seconds(61));
        let full = f.aggregator.full();
        assert_eq!(full.minute_counts.len(), 1);
        assert_eq!(full.resource_samples.len(), 2);
    }

    #[test]
    fn test_windows_are_bounded() {
        let f = fixture(3);
        for i in 0..5 {
            f.aggregator.sample_resources();
            f.aggregator.record_response_time(f64::from(i) * 100.0);
        }

        let full = f.aggregator.full();
        assert_eq!(full.resource_samples.len(), 3);
        assert_eq!(full.response_times_ms, vec![200.0, 300.0, 400.0]);
        assert_eq!(full.detailed.basic.avg_response_ms, 300.0);
        assert_eq!(full.detailed.basic.cpu_percent, 14.0);
        assert_eq!(full.detailed.averages.avg_cpu_percent, 13.0);
    }

    #[test]
    fn test_success_rate() {
        let f = fixture(60);
        assert_eq!(f.aggregator.detailed().averages.success_rate, None);
        f.aggregator.record_operation_result(true);
        f.aggregator.record_operation_result(true);
        f.aggregator.record_operation_result(true);
        f.aggregator.record_operation_result(false);
        assert_eq!(f.aggregator.detailed().averages.success_rate, Some(0.75));
    }

    #[test]
    fn test_tiers_limit_connections_and_alerts() {
        let f = fixture(60);
        for i in 0..15 {
            f.connections.register_or_touch(&format!("client-{}", i));
        }
        for _ in 0..25 {
            alert(&f.alerts, Severity::Low);
        }

        let full = f.aggregator.full();
        assert_eq!(full.detailed.recent_connections.len(), 10);
        assert_eq!(full.detailed.recent_alerts.len(), 20);
        assert_eq!(full.connections.len(), 15);
        assert_eq!(full.alerts.len(), 25);
        assert_eq!(full.detailed.basic.active_connections, 15);
        assert_eq!(full.host.hostname, "test-host");
    }

    #[test]
    fn test_tiers_serialize_as_supersets() {
        let f = fixture(60);
        f.aggregator.sample_resources();
        alert(&f.alerts, Severity::High);

        let full = serde_json::to_value(f.aggregator.full()).unwrap();
        let detailed = serde_json::to_value(f.aggregator.detailed()).unwrap();
        let basic = serde_json::to_value(f.aggregator.basic()).unwrap();

        let keys = |v: &serde_json::Value| -> Vec<String> {
            v.as_object().unwrap().keys().cloned().collect()
        };
        for key in keys(&basic) {
            assert!(detailed.get(&key).is_some(), "detailed lacks {}", key);
        }
        for key in keys(&detailed) {
            assert!(full.get(&key).is_some(), "full lacks {}", key);
        }
        assert_eq!(full["status"], "ERROR");
        assert_eq!(full["alert_counts"]["high"], 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let f = fixture(60);
        let mut basic_rx = f.aggregator.subscribe_basic();
        let full_rx = f.aggregator.subscribe_full();
        assert!(basic_rx.borrow().is_none());

        alert(&f.alerts, Severity::Medium);
        f.aggregator.publish_basic();
        basic_rx.changed().await.unwrap();
        assert_eq!(
            basic_rx.borrow().as_ref().map(|b| b.status),
            Some(OverallStatus::Warning)
        );

        f.aggregator.publish_full();
        assert!(full_rx.borrow().is_some());
    }
}

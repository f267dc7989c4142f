//! Composition root and background scheduling
//!
//! MonitorService builds every component once, wires the inactivity and
//! resource feeds into the rule engine and owns the periodic tasks. Each
//! task runs on its own tokio interval and stops when the shared shutdown
//! signal flips; `stop` then joins them and drains the usage buffer.

use crate::alerts::{
    default_rules, Alert, AlertManager, CLIENT_INACTIVE_RULE, HIGH_CPU_RULE, HIGH_MEMORY_RULE,
};
use crate::config::MonitorConfig;
use crate::connections::ConnectionRegistry;
use crate::details;
use crate::error::ServiceError;
use crate::eventlog::EventLog;
use crate::events::Details;
use crate::status::{ResourceProbe, ResourceSample, StatusAggregator, SystemProbe};
use crate::usage::{UsageMonitor, UsageRepository};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const RESOURCE_RULES: [&str; 2] = [HIGH_CPU_RULE, HIGH_MEMORY_RULE];

/// Owns the monitoring components and their background tasks
pub struct MonitorService {
    config: MonitorConfig,
    event_log: Arc<EventLog>,
    connections: Arc<ConnectionRegistry>,
    alerts: Arc<AlertManager>,
    usage: Arc<UsageMonitor>,
    status: Arc<StatusAggregator>,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl MonitorService {
    /// Build the components with the host resource probe
    pub fn new(config: MonitorConfig, repository: Arc<dyn UsageRepository>) -> Self {
        Self::with_probe(config, repository, Box::new(SystemProbe::new()))
    }

    /// Build the components with a custom resource probe
    pub fn with_probe(
        config: MonitorConfig,
        repository: Arc<dyn UsageRepository>,
        probe: Box<dyn ResourceProbe>,
    ) -> Self {
        let event_log = Arc::new(EventLog::from_config(&config.event_log));
        let connections = Arc::new(ConnectionRegistry::from_config(
            Arc::clone(&event_log),
            &config.connections,
        ));
        let alerts = Arc::new(AlertManager::from_config(
            Arc::clone(&event_log),
            &config.alerts,
        ));
        let usage = Arc::new(UsageMonitor::new(
            repository,
            Arc::clone(&alerts),
            Arc::clone(&event_log),
            config.usage.clone(),
        ));
        let status = Arc::new(StatusAggregator::new(
            Arc::clone(&connections),
            Arc::clone(&alerts),
            Arc::clone(&event_log),
            probe,
            &config.status,
        ));

        for rule in default_rules(&config.status) {
            alerts.add_rule(rule);
        }

        let rule_engine = Arc::clone(&alerts);
        connections.on_inactive(Box::new(move |connection| {
            let context = details! {
                "event" => CLIENT_INACTIVE_RULE,
                "client_id" => connection.client_id.clone(),
                "idle_seconds" => connection.idle_for(Utc::now()).num_seconds(),
            };
            rule_engine.evaluate(&context, None);
            Ok(())
        }));

        info!("Monitoring components initialized");
        Self {
            config,
            event_log,
            connections,
            alerts,
            usage,
            status,
            shutdown_tx: None,
            tasks: Vec::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn usage(&self) -> &Arc<UsageMonitor> {
        &self.usage
    }

    pub fn status(&self) -> &Arc<StatusAggregator> {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Take a resource sample and feed it to the resource rules
    pub fn sample_resources(&self) -> Vec<Alert> {
        sample_and_evaluate(&self.status, &self.alerts)
    }

    /// Spawn every background task on the current tokio runtime
    ///
    /// # Errors
    ///
    /// `ServiceError::AlreadyRunning` if the tasks are already running,
    /// `ServiceError::NoRuntime` when called outside a tokio runtime.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.is_running() {
            return Err(ServiceError::AlreadyRunning);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ServiceError::NoRuntime);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connections = Arc::clone(&self.connections);
        self.tasks.push((
            "connection sweep",
            spawn_periodic(
                "connection sweep",
                self.config.connections.check_interval(),
                shutdown_rx.clone(),
                move || {
                    connections.sweep_inactive();
                    async {}
                },
            ),
        ));

        let alerts = Arc::clone(&self.alerts);
        self.tasks.push((
            "alert auto-resolve",
            spawn_periodic(
                "alert auto-resolve",
                self.config.alerts.check_interval(),
                shutdown_rx.clone(),
                move || {
                    alerts.auto_resolve_expired();
                    async {}
                },
            ),
        ));

        let usage = Arc::clone(&self.usage);
        self.tasks.push((
            "usage cycle",
            spawn_periodic(
                "usage cycle",
                self.config.usage.flush_interval(),
                shutdown_rx.clone(),
                move || {
                    let usage = Arc::clone(&usage);
                    async move {
                        let summary = usage.run_cycle().await;
                        debug!("Usage cycle: {:?}", summary);
                    }
                },
            ),
        ));

        let (status, alerts) = (Arc::clone(&self.status), Arc::clone(&self.alerts));
        self.tasks.push((
            "resource sampler",
            spawn_periodic(
                "resource sampler",
                self.config.status.sample_interval(),
                shutdown_rx.clone(),
                move || {
                    sample_and_evaluate(&status, &alerts);
                    async {}
                },
            ),
        ));

        let status = Arc::clone(&self.status);
        self.tasks.push((
            "basic status",
            spawn_periodic(
                "basic status",
                self.config.status.basic_interval(),
                shutdown_rx.clone(),
                move || {
                    status.publish_basic();
                    async {}
                },
            ),
        ));

        let status = Arc::clone(&self.status);
        self.tasks.push((
            "detailed status",
            spawn_periodic(
                "detailed status",
                self.config.status.detailed_interval(),
                shutdown_rx.clone(),
                move || {
                    status.publish_detailed();
                    async {}
                },
            ),
        ));

        let status = Arc::clone(&self.status);
        self.tasks.push((
            "full status",
            spawn_periodic(
                "full status",
                self.config.status.full_interval(),
                shutdown_rx,
                move || {
                    status.publish_full();
                    async {}
                },
            ),
        ));

        self.shutdown_tx = Some(shutdown_tx);
        info!("Started {} background tasks", self.tasks.len());
        Ok(())
    }

    /// Stop every task, wait for them and drain the usage buffer
    ///
    /// Returns the number of usage records written by the final drain.
    ///
    /// # Errors
    ///
    /// `ServiceError::NotRunning` if `start` was not called, and
    /// `ServiceError::TaskJoin` if a task panicked. The drain runs in both
    /// cases once the tasks are down.
    pub async fn stop(&mut self) -> Result<usize, ServiceError> {
        let shutdown_tx = self.shutdown_tx.take().ok_or(ServiceError::NotRunning)?;
        info!("Stopping background tasks");
        // Receivers may already be gone if every task ended on its own
        let _ = shutdown_tx.send(true);

        let mut join_failures = Vec::new();
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!("Background task '{}' failed: {}", name, e);
                join_failures.push(format!("{}: {}", name, e));
            }
        }

        let drained = match self.usage.flush().await {
            Ok(count) => {
                info!("Final usage drain wrote {} records", count);
                count
            }
            Err(e) => {
                self.event_log.system_error(
                    format!("Final usage drain failed: {}", e),
                    details! { "buffered" => self.usage.buffered() },
                );
                0
            }
        };

        if join_failures.is_empty() {
            Ok(drained)
        } else {
            Err(ServiceError::TaskJoin(join_failures.join("; ")))
        }
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            warn!("MonitorService dropped while running; usage buffer not drained");
            let _ = shutdown_tx.send(true);
        }
    }
}

/// Run `tick` every `period` until the shutdown signal changes
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("{} task running every {:?}", name, period);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }

        debug!("{} task stopped", name);
    })
}

/// Sample resources and evaluate the resource rules that have no active alert
fn sample_and_evaluate(status: &StatusAggregator, alerts: &AlertManager) -> Vec<Alert> {
    let sample = status.tick_at(Utc::now());
    let pending = rules_without_active_alert(alerts);
    if pending.is_empty() {
        return Vec::new();
    }
    alerts.evaluate(&resource_context(&sample), Some(pending.as_slice()))
}

fn rules_without_active_alert(alerts: &AlertManager) -> Vec<&'static str> {
    let active = alerts.active_alerts();
    RESOURCE_RULES
        .into_iter()
        .filter(|rule| {
            let source = format!("rule:{}", rule);
            !active.iter().any(|alert| alert.source == source)
        })
        .collect()
}

fn resource_context(sample: &ResourceSample) -> Details {
    details! {
        "cpu_percent" => sample.cpu_percent,
        "memory_percent" => sample.memory_percent,
    }
}

//! Alert store and rule engine
//!
//! The AlertManager owns the bounded alert history, assigns monotonic ids,
//! enforces the alert lifecycle, evaluates registered rules against
//! arbitrary context maps and runs the auto-resolve sweep. Every state
//! change is audited in the event log.

use crate::alerts::alert::{Alert, AlertQuery, AlertRequest, AlertStatus};
use crate::alerts::rules::{AlertRule, RuleContext};
use crate::callback::{panic_message, run_isolated};
use crate::config::AlertConfig;
use crate::details;
use crate::error::RuleError;
use crate::eventlog::EventLog;
use crate::events::{Category, LogLevel, Outcome, Severity, Timestamp};
use chrono::Utc;
use log::{debug, info};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Callback invoked for every newly created alert
pub type AlertCallback = Box<dyn Fn(&Alert) -> anyhow::Result<()> + Send + Sync>;

type AlertCallbackFn = dyn Fn(&Alert) -> anyhow::Result<()> + Send + Sync;

/// A registered rule and its enabled flag
struct RuleEntry {
    rule: Arc<dyn AlertRule>,
    enabled: bool,
}

/// Alert lifecycle store and rule engine
pub struct AlertManager {
    /// Alert history, oldest first
    alerts: Mutex<VecDeque<Alert>>,
    rules: RwLock<Vec<RuleEntry>>,
    callbacks: RwLock<Vec<Arc<AlertCallbackFn>>>,
    next_id: AtomicU64,
    history_limit: usize,
    event_log: Arc<EventLog>,
}

impl AlertManager {
    pub fn new(event_log: Arc<EventLog>, history_limit: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(history_limit.min(4096))),
            rules: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            history_limit,
            event_log,
        }
    }

    pub fn from_config(event_log: Arc<EventLog>, config: &AlertConfig) -> Self {
        Self::new(event_log, config.history_limit)
    }

    /// Register a callback fired for every created alert
    pub fn on_alert(&self, callback: AlertCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::from(callback));
    }

    /// Create an alert now
    pub fn create_alert(&self, request: AlertRequest) -> Alert {
        self.create_alert_at(request, Utc::now())
    }

    /// Create an alert with an explicit creation time
    ///
    /// The auto-resolve deadline, if any, is computed from `now`.
    pub fn create_alert_at(&self, request: AlertRequest, now: Timestamp) -> Alert {
        // Ids are taken under the history lock so insertion order matches id order
        let alert = {
            let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let alert = Alert::from_request(id, request, now);
            alerts.push_back(alert.clone());
            while alerts.len() > self.history_limit {
                if let Some(dropped) = alerts.pop_front() {
                    debug!("Alert history full, dropping alert #{}", dropped.id);
                }
            }
            alert
        };

        self.event_log.record(
            alert.severity.log_level(),
            alert.client_id.as_deref(),
            Category::Alert,
            Outcome::Success,
            details! {
                "alert_id" => alert.id,
                "severity" => alert.severity,
                "category" => alert.category.as_str(),
                "source" => alert.source.clone(),
            },
            format!("Alert #{} created: {}", alert.id, alert.message),
        );

        // Snapshot so callbacks may register callbacks or create alerts themselves
        let callbacks: Vec<Arc<AlertCallbackFn>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in callbacks.iter() {
            if let Err(e) = run_isolated(|| callback(&alert)) {
                self.event_log.system_error(
                    format!("Alert callback failed for alert #{}: {}", alert.id, e),
                    details! { "alert_id" => alert.id },
                );
            }
        }

        alert
    }

    /// Acknowledge an OPEN alert
    pub fn acknowledge(&self, id: u64, by: &str) -> bool {
        self.transition(id, by, "acknowledged", |alert, now| {
            alert.acknowledge(by, now)
        })
    }

    /// Resolve an OPEN or ACKNOWLEDGED alert
    pub fn resolve(&self, id: u64, by: &str) -> bool {
        self.transition(id, by, "resolved", |alert, now| alert.resolve(by, now))
    }

    fn transition<F>(&self, id: u64, by: &str, verb: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Alert, Timestamp) -> bool,
    {
        let now = Utc::now();
        let updated = {
            let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            match alerts.iter_mut().find(|alert| alert.id == id) {
                Some(alert) => {
                    if apply(alert, now) {
                        Some(alert.clone())
                    } else {
                        debug!(
                            "Alert #{} cannot be {} from status {:?}",
                            id, verb, alert.status
                        );
                        None
                    }
                }
                None => {
                    debug!("Alert #{} not found", id);
                    None
                }
            }
        };

        match updated {
            Some(alert) => {
                self.event_log.record(
                    LogLevel::Info,
                    alert.client_id.as_deref(),
                    Category::Alert,
                    Outcome::Success,
                    details! { "alert_id" => alert.id, "by" => by },
                    format!("Alert #{} {} by {}", alert.id, verb, by),
                );
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|alert| alert.id == id)
            .cloned()
    }

    /// Alerts matching `query`, newest first
    pub fn list(&self, query: &AlertQuery) -> Vec<Alert> {
        let alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = alerts.iter().rev().filter(|alert| query.matches(alert));
        match query.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        }
    }

    /// The `count` most recent alerts, newest first
    pub fn recent(&self, count: usize) -> Vec<Alert> {
        self.list(&AlertQuery {
            limit: Some(count),
            ..Default::default()
        })
    }

    /// OPEN and ACKNOWLEDGED alerts, newest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .filter(|alert| alert.is_active())
            .cloned()
            .collect()
    }

    /// Number of active alerts per severity; every severity is present
    pub fn counts_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts: BTreeMap<Severity, usize> =
            Severity::all().into_iter().map(|s| (s, 0)).collect();
        let alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
        for alert in alerts.iter().filter(|alert| alert.is_active()) {
            *counts.entry(alert.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a rule, replacing any rule with the same id
    pub fn add_rule(&self, rule: Box<dyn AlertRule>) {
        let rule: Arc<dyn AlertRule> = Arc::from(rule);
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = rules.iter_mut().find(|entry| entry.rule.id() == rule.id()) {
            info!("Replacing alert rule '{}'", rule.id());
            entry.rule = rule;
            entry.enabled = true;
        } else {
            info!("Registered alert rule '{}' ({})", rule.id(), rule.name());
            rules.push(RuleEntry {
                rule,
                enabled: true,
            });
        }
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|entry| entry.rule.id() != id);
        before != rules.len()
    }

    pub fn enable_rule(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        match rules.iter_mut().find(|entry| entry.rule.id() == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Ids of all registered rules, in registration order
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.rule.id().to_string())
            .collect()
    }

    pub fn is_rule_enabled(&self, id: &str) -> Option<bool> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.rule.id() == id)
            .map(|entry| entry.enabled)
    }

    /// Evaluate enabled rules (or the enabled subset named by `rule_ids`)
    /// against `context` and create an alert for each rule that fires
    ///
    /// A rule whose predicate or template fails is logged as a system error
    /// and skipped; its siblings are still evaluated.
    pub fn evaluate(&self, context: &RuleContext, rule_ids: Option<&[&str]>) -> Vec<Alert> {
        let candidates: Vec<Arc<dyn AlertRule>> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.enabled)
            .filter(|entry| rule_ids.map_or(true, |ids| ids.contains(&entry.rule.id())))
            .map(|entry| Arc::clone(&entry.rule))
            .collect();

        let mut created = Vec::new();
        for rule in candidates {
            match Self::fire(rule.as_ref(), context) {
                Ok(Some(message)) => {
                    let mut details = context.clone();
                    details.insert("rule_id".to_string(), Value::from(rule.id()));

                    let mut request = AlertRequest::new(rule.severity(), rule.category(), message)
                        .details(details)
                        .source(format!("rule:{}", rule.id()));
                    if let Some(client_id) = context.get("client_id").and_then(Value::as_str) {
                        request = request.client_id(client_id);
                    }
                    if let Some(after) = rule.auto_resolve_after() {
                        request = request.auto_resolve_after(after);
                    }
                    created.push(self.create_alert(request));
                }
                Ok(None) => {}
                Err(e) => {
                    self.event_log.system_error(
                        format!("Alert rule '{}' failed: {}", rule.id(), e),
                        details! { "rule_id" => rule.id() },
                    );
                }
            }
        }

        created
    }

    /// Evaluate one rule, isolating panics; `Ok(Some(message))` when it fires
    fn fire(rule: &dyn AlertRule, context: &RuleContext) -> Result<Option<String>, RuleError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if rule.evaluate(context)? {
                rule.render(context).map(Some)
            } else {
                Ok(None)
            }
        }));

        match outcome {
            Ok(result) => result,
            Err(panic) => Err(RuleError::EvaluationFailed(panic_message(panic.as_ref()))),
        }
    }

    /// Run the auto-resolve sweep against the current time
    pub fn auto_resolve_expired(&self) -> Vec<Alert> {
        self.auto_resolve_expired_at(Utc::now())
    }

    /// Move every active alert whose deadline is at or before `now` to
    /// AUTO_RESOLVED, returning the transitioned alerts
    pub fn auto_resolve_expired_at(&self, now: Timestamp) -> Vec<Alert> {
        let resolved: Vec<Alert> = {
            let mut alerts = self.alerts.lock().unwrap_or_else(PoisonError::into_inner);
            alerts
                .iter_mut()
                .filter_map(|alert| alert.auto_resolve(now).then(|| alert.clone()))
                .collect()
        };

        for alert in &resolved {
            self.event_log.record(
                LogLevel::Info,
                alert.client_id.as_deref(),
                Category::Alert,
                Outcome::Success,
                details! { "alert_id" => alert.id, "status" => AlertStatus::AutoResolved },
                format!("Alert #{} auto-resolved", alert.id),
            );
        }

        if !resolved.is_empty() {
            info!("Auto-resolved {} alert(s)", resolved.len());
        }
        resolved
    }
}

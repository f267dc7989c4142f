//! Usage and cost monitoring for external compute providers
//!
//! Producers hand every provider call to [`UsageMonitor::record_usage`].
//! The record is buffered for persistence, folded into the provider's
//! rolling statistics and checked for anomalies before the call returns.
//! The background cycle flushes the buffer, re-evaluates provider
//! performance from the repository and writes one report per day.

use crate::alerts::{Alert, AlertManager, AlertRequest};
use crate::config::UsageConfig;
use crate::details;
use crate::error::RepositoryError;
use crate::eventlog::EventLog;
use crate::events::{Category, Details, LogLevel, Outcome, Severity, Timestamp};
use crate::usage::record::{PerformanceStats, UsageRecord};
use crate::usage::report::DailyReport;
use crate::usage::repository::UsageRepository;
use chrono::{Duration, NaiveDate, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

/// Alert source tag for everything raised by the usage monitor
pub const USAGE_ALERT_SOURCE: &str = "usage_monitor";

const LOW_SUCCESS_RATE: &str = "low_success_rate";
const SLOW_AVERAGE: &str = "slow_average";

/// What one background cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Records persisted by the flush; zero when the flush failed
    pub flushed: usize,
    pub flush_failed: bool,
    pub performance_alerts: usize,
    /// Date covered by the daily report written this cycle
    pub report_date: Option<NaiveDate>,
}

/// Usage buffer, rolling provider statistics and anomaly detection
pub struct UsageMonitor {
    buffer: Mutex<VecDeque<UsageRecord>>,
    stats: Mutex<HashMap<String, PerformanceStats>>,
    /// Date of the cycle that last wrote a daily report
    last_report_cycle: Mutex<Option<NaiveDate>>,
    /// Serializes flushes so requeued records keep their order
    flush_guard: tokio::sync::Mutex<()>,
    repository: Arc<dyn UsageRepository>,
    alerts: Arc<AlertManager>,
    event_log: Arc<EventLog>,
    config: UsageConfig,
}

impl UsageMonitor {
    pub fn new(
        repository: Arc<dyn UsageRepository>,
        alerts: Arc<AlertManager>,
        event_log: Arc<EventLog>,
        config: UsageConfig,
    ) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(config.buffer_capacity)),
            stats: Mutex::new(HashMap::new()),
            last_report_cycle: Mutex::new(None),
            flush_guard: tokio::sync::Mutex::new(()),
            repository,
            alerts,
            event_log,
            config,
        }
    }

    pub fn config(&self) -> &UsageConfig {
        &self.config
    }

    /// Record one provider call
    ///
    /// Statistics and the anomaly checks are applied before returning; the
    /// returned alerts are the ones raised for this record. When the buffer
    /// reaches capacity it is flushed inline. Repository failures are logged
    /// and never surface to the producer.
    pub async fn record_usage(&self, record: UsageRecord) -> Vec<Alert> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(record.provider.clone())
            .or_default()
            .update(&record);

        let buffered = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push_back(record.clone());
            buffer.len()
        };

        self.event_log.record(
            if record.success {
                LogLevel::Info
            } else {
                LogLevel::Warning
            },
            None,
            Category::Usage,
            if record.success {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            details! {
                "provider" => record.provider.clone(),
                "request_kind" => record.request_kind.clone(),
                "duration_ms" => record.duration_ms,
                "cost" => record.cost,
            },
            format!(
                "{} {} request took {}ms",
                record.provider, record.request_kind, record.duration_ms
            ),
        );

        let mut raised = self.check_record(&record);
        if let Some(alert) = self.check_daily_cost(&record).await {
            raised.push(alert);
        }

        if buffered >= self.config.buffer_capacity {
            debug!("Usage buffer reached {} records, flushing", buffered);
            if let Err(e) = self.flush().await {
                self.report_flush_failure(&e);
            }
        }

        raised
    }

    /// Threshold checks that need nothing but the record itself
    fn check_record(&self, record: &UsageRecord) -> Vec<Alert> {
        let mut raised = Vec::new();
        let provider = record.provider.as_str();

        if !record.success {
            let reason = record.error.as_deref().unwrap_or("unknown error");
            raised.push(self.raise(
                Severity::High,
                Category::Usage,
                format!("Provider {} request failed: {}", provider, reason),
                details! {
                    "provider" => provider,
                    "request_kind" => record.request_kind.clone(),
                    "error" => reason,
                },
            ));
        }

        if record.duration_ms > self.config.slow_response_ms {
            raised.push(self.raise(
                Severity::Medium,
                Category::Performance,
                format!(
                    "Provider {} slow response: {}ms exceeds {}ms",
                    provider, record.duration_ms, self.config.slow_response_ms
                ),
                details! {
                    "provider" => provider,
                    "duration_ms" => record.duration_ms,
                    "threshold_ms" => self.config.slow_response_ms,
                },
            ));
        }

        if record.input_size > self.config.large_input_threshold {
            raised.push(self.raise(
                Severity::Low,
                Category::Usage,
                format!(
                    "Provider {} large input: {} exceeds {}",
                    provider, record.input_size, self.config.large_input_threshold
                ),
                details! {
                    "provider" => provider,
                    "input_size" => record.input_size,
                    "threshold" => self.config.large_input_threshold,
                },
            ));
        }

        raised
    }

    /// Compare the provider's cost for the record's day against its limit
    async fn check_daily_cost(&self, record: &UsageRecord) -> Option<Alert> {
        let limit = *self.config.cost_thresholds.get(&record.provider)?;
        if limit <= 0.0 {
            return None;
        }

        let day = record.timestamp.date_naive();
        let cost = match self.repository.daily_cost(&record.provider, day).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(
                    "Skipping cost check for {}: daily cost query failed: {}",
                    record.provider, e
                );
                return None;
            }
        };

        let ratio = cost / limit;
        let details = details! {
            "provider" => record.provider.clone(),
            "daily_cost" => cost,
            "limit" => limit,
            "ratio" => ratio,
            "date" => day.to_string(),
        };

        if ratio >= 1.0 {
            Some(self.raise(
                Severity::High,
                Category::Cost,
                format!(
                    "Provider {} daily cost limit exceeded: {:.2} of {:.2}",
                    record.provider, cost, limit
                ),
                details,
            ))
        } else if ratio >= self.config.cost_warning_ratio {
            Some(self.raise(
                Severity::Medium,
                Category::Cost,
                format!(
                    "Provider {} approaching daily cost limit: {:.2} of {:.2}",
                    record.provider, cost, limit
                ),
                details,
            ))
        } else {
            None
        }
    }

    fn raise(
        &self,
        severity: Severity,
        category: Category,
        message: String,
        details: Details,
    ) -> Alert {
        self.alerts.create_alert(
            AlertRequest::new(severity, category, message)
                .details(details)
                .source(USAGE_ALERT_SOURCE)
                .auto_resolve_after(self.config.alert_auto_resolve()),
        )
    }

    /// Persist every buffered record, returning how many were written
    ///
    /// The buffer lock is released before any repository call. Records that
    /// were not written go back to the front of the buffer in their original
    /// order, ahead of anything recorded during the flush.
    pub async fn flush(&self) -> Result<usize, RepositoryError> {
        let _guard = self.flush_guard.lock().await;

        let pending: Vec<UsageRecord> = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        for (written, record) in pending.iter().enumerate() {
            if let Err(e) = self.repository.insert_usage(record).await {
                let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
                for unwritten in pending[written..].iter().rev() {
                    buffer.push_front(unwritten.clone());
                }
                warn!(
                    "Usage flush stopped after {} of {} records; {} buffered for retry",
                    written,
                    pending.len(),
                    buffer.len()
                );
                return Err(e);
            }
        }

        debug!("Flushed {} usage records", pending.len());
        Ok(pending.len())
    }

    fn report_flush_failure(&self, e: &RepositoryError) {
        self.event_log.system_error(
            format!("Usage flush failed: {}", e),
            details! { "buffered" => self.buffered() },
        );
    }

    /// Number of records waiting to be persisted
    pub fn buffered(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Rolling statistics for one provider since startup
    pub fn stats(&self, provider: &str) -> Option<PerformanceStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<String, PerformanceStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(provider, stats)| (provider.clone(), stats.clone()))
            .collect()
    }

    /// Providers seen since startup plus those with a configured cost limit
    fn known_providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        providers.extend(self.config.cost_thresholds.keys().cloned());
        providers.sort();
        providers.dedup();
        providers
    }

    /// Whether a performance alert for this provider and condition is still
    /// OPEN or ACKNOWLEDGED
    fn performance_alert_active(active: &[Alert], provider: &str, condition: &str) -> bool {
        active.iter().any(|alert| {
            alert.source == USAGE_ALERT_SOURCE
                && alert.category == Category::Performance
                && alert.details.get("provider").and_then(|v| v.as_str()) == Some(provider)
                && alert.details.get("condition").and_then(|v| v.as_str()) == Some(condition)
        })
    }

    /// Re-evaluate each provider over the configured window and alert on
    /// low success rates or slow average responses
    ///
    /// A provider raises at most one alert per condition until that alert
    /// is resolved or auto-resolves.
    pub async fn analyze_performance(&self) -> Vec<Alert> {
        let mut raised = Vec::new();
        let active = self.alerts.active_alerts();

        for provider in self.known_providers() {
            let stats = match self
                .repository
                .provider_performance(&provider, self.config.performance_window_days)
                .await
            {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Performance query for {} failed: {}", provider, e);
                    continue;
                }
            };
            if stats.count == 0 {
                continue;
            }

            if stats.success_rate < self.config.min_success_rate
                && !Self::performance_alert_active(&active, &provider, LOW_SUCCESS_RATE)
            {
                raised.push(self.raise(
                    Severity::Medium,
                    Category::Performance,
                    format!(
                        "Provider {} success rate {:.1}% below {:.1}%",
                        provider,
                        stats.success_rate * 100.0,
                        self.config.min_success_rate * 100.0
                    ),
                    details! {
                        "provider" => provider.clone(),
                        "condition" => LOW_SUCCESS_RATE,
                        "success_rate" => stats.success_rate,
                        "requests" => stats.count,
                    },
                ));
            }

            if stats.avg_duration_ms > self.config.max_avg_duration_ms
                && !Self::performance_alert_active(&active, &provider, SLOW_AVERAGE)
            {
                raised.push(self.raise(
                    Severity::Medium,
                    Category::Performance,
                    format!(
                        "Provider {} average response {:.0}ms exceeds {:.0}ms",
                        provider, stats.avg_duration_ms, self.config.max_avg_duration_ms
                    ),
                    details! {
                        "provider" => provider.clone(),
                        "condition" => SLOW_AVERAGE,
                        "avg_duration_ms" => stats.avg_duration_ms,
                        "requests" => stats.count,
                    },
                ));
            }
        }

        raised
    }

    /// Build and persist the report for `date` from repository records
    pub async fn generate_daily_report(
        &self,
        date: NaiveDate,
    ) -> Result<DailyReport, RepositoryError> {
        let start = date.and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc());
        let Some(start) = start else {
            return Err(RepositoryError::QueryFailed(format!(
                "invalid report date {}",
                date
            )));
        };
        let end = start + Duration::days(1);

        let records = self.repository.usage_in_range(start, end).await?;
        let report = DailyReport::from_records(date, &records);
        self.repository.save_daily_report(&report).await?;

        info!(
            "Daily usage report for {}: {} requests, cost {:.2}",
            date, report.total_requests, report.total_cost
        );
        Ok(report)
    }

    /// One background cycle against the current time
    pub async fn run_cycle(&self) -> CycleSummary {
        self.run_cycle_at(Utc::now()).await
    }

    /// Flush, analyze performance and, on the first cycle of a new day,
    /// write the report for the previous day
    pub async fn run_cycle_at(&self, now: Timestamp) -> CycleSummary {
        let mut summary = CycleSummary::default();

        match self.flush().await {
            Ok(count) => summary.flushed = count,
            Err(e) => {
                summary.flush_failed = true;
                self.report_flush_failure(&e);
            }
        }

        summary.performance_alerts = self.analyze_performance().await.len();

        let today = now.date_naive();
        let last = *self
            .last_report_cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last != Some(today) {
            if let Some(yesterday) = today.pred_opt() {
                match self.generate_daily_report(yesterday).await {
                    Ok(report) => {
                        *self
                            .last_report_cycle
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(today);
                        summary.report_date = Some(report.date);
                    }
                    Err(e) => {
                        error!("Daily usage report for {} failed: {}", yesterday, e);
                        self.event_log.system_error(
                            format!("Daily usage report failed: {}", e),
                            details! { "date" => yesterday.to_string() },
                        );
                    }
                }
            }
        }

        summary
    }
}

//! Durable storage collaborator for usage records
//!
//! The monitor only ever talks to storage through [`UsageRepository`]. The
//! in-memory implementation backs the binary and the tests; a database
//! implementation lives outside this crate.

use crate::error::RepositoryError;
use crate::events::Timestamp;
use crate::usage::record::{PerformanceStats, UsageRecord};
use crate::usage::report::DailyReport;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::debug;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Boxed future returned by repository operations
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Trait for durable usage storage
pub trait UsageRepository: Send + Sync {
    /// Persist one record, returning its storage id
    fn insert_usage<'a>(&'a self, record: &'a UsageRecord) -> RepoFuture<'a, u64>;

    /// Records with `start <= timestamp < end`, oldest first
    fn usage_in_range<'a>(
        &'a self,
        start: Timestamp,
        end: Timestamp,
    ) -> RepoFuture<'a, Vec<UsageRecord>>;

    /// Sum of the costs recorded for `provider` on `day` (UTC)
    fn daily_cost<'a>(&'a self, provider: &'a str, day: NaiveDate) -> RepoFuture<'a, f64>;

    /// Statistics for `provider` over the last `days` days
    fn provider_performance<'a>(
        &'a self,
        provider: &'a str,
        days: u32,
    ) -> RepoFuture<'a, PerformanceStats>;

    /// Store the report, replacing any report for the same date
    fn save_daily_report<'a>(&'a self, report: &'a DailyReport) -> RepoFuture<'a, ()>;
}

/// Repository keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryUsageRepository {
    records: Mutex<Vec<(u64, UsageRecord)>>,
    reports: Mutex<BTreeMap<NaiveDate, DailyReport>>,
    next_id: AtomicU64,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored record in insertion order
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn report(&self, date: NaiveDate) -> Option<DailyReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&date)
            .cloned()
    }

    fn matching<F>(&self, filter: F) -> Vec<UsageRecord>
    where
        F: Fn(&UsageRecord) -> bool,
    {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, record)| record)
            .filter(|record| filter(record))
            .cloned()
            .collect()
    }
}

impl UsageRepository for MemoryUsageRepository {
    fn insert_usage<'a>(&'a self, record: &'a UsageRecord) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((id, record.clone()));
            Ok(id)
        })
    }

    fn usage_in_range<'a>(
        &'a self,
        start: Timestamp,
        end: Timestamp,
    ) -> RepoFuture<'a, Vec<UsageRecord>> {
        Box::pin(async move {
            let mut records =
                self.matching(|record| record.timestamp >= start && record.timestamp < end);
            records.sort_by_key(|record| record.timestamp);
            Ok(records)
        })
    }

    fn daily_cost<'a>(&'a self, provider: &'a str, day: NaiveDate) -> RepoFuture<'a, f64> {
        Box::pin(async move {
            let cost = self
                .matching(|record| {
                    record.provider == provider && record.timestamp.date_naive() == day
                })
                .iter()
                .map(|record| record.cost)
                .sum::<f64>();
            Ok(cost)
        })
    }

    fn provider_performance<'a>(
        &'a self,
        provider: &'a str,
        days: u32,
    ) -> RepoFuture<'a, PerformanceStats> {
        Box::pin(async move {
            let since = Utc::now()
                .checked_sub_signed(Duration::days(i64::from(days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let records = self
                .matching(|record| record.provider == provider && record.timestamp >= since);
            Ok(PerformanceStats::from_records(&records))
        })
    }

    fn save_daily_report<'a>(&'a self, report: &'a DailyReport) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            debug!("Storing daily usage report for {}", report.date);
            self.reports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(report.date, report.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let repo = MemoryUsageRepository::new();
        let first = repo.insert_usage(&UsageRecord::new("p", "a")).await.unwrap();
        let second = repo.insert_usage(&UsageRecord::new("p", "a")).await.unwrap();
        assert!(second > first);
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn test_daily_cost_per_provider_and_day() {
        let repo = MemoryUsageRepository::new();
        let morning = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        for record in [
            UsageRecord::new("p", "a").at(morning).cost(1.25),
            UsageRecord::new("p", "a").at(morning).cost(2.0),
            UsageRecord::new("q", "a").at(morning).cost(7.0),
            UsageRecord::new("p", "a")
                .at(morning - Duration::days(1))
                .cost(3.0),
        ] {
            repo.insert_usage(&record).await.unwrap();
        }

        let day = morning.date_naive();
        assert_eq!(repo.daily_cost("p", day).await.unwrap(), 3.25);
        assert_eq!(repo.daily_cost("q", day).await.unwrap(), 7.0);
        assert_eq!(repo.daily_cost("r", day).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_range_is_half_open_and_sorted() {
        let repo = MemoryUsageRepository::new();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(1);
        repo.insert_usage(&UsageRecord::new("late", "a").at(start + Duration::hours(5)))
            .await
            .unwrap();
        repo.insert_usage(&UsageRecord::new("early", "a").at(start))
            .await
            .unwrap();
        repo.insert_usage(&UsageRecord::new("next", "a").at(end))
            .await
            .unwrap();

        let records = repo.usage_in_range(start, end).await.unwrap();
        let providers: Vec<&str> = records.iter().map(|r| r.provider.as_str()).collect();
        assert_eq!(providers, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_provider_performance_window() {
        let repo = MemoryUsageRepository::new();
        repo.insert_usage(&UsageRecord::new("p", "a").duration_ms(100))
            .await
            .unwrap();
        repo.insert_usage(
            &UsageRecord::new("p", "a")
                .at(Utc::now() - Duration::days(3))
                .duration_ms(9000),
        )
        .await
        .unwrap();

        let stats = repo.provider_performance("p", 1).await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.avg_duration_ms, 100.0);
    }

    #[tokio::test]
    async fn test_window_beyond_calendar_covers_all_history() {
        let repo = MemoryUsageRepository::new();
        repo.insert_usage(
            &UsageRecord::new("p", "a")
                .at(Utc::now() - Duration::days(365 * 50))
                .duration_ms(300),
        )
        .await
        .unwrap();

        let stats = repo.provider_performance("p", u32::MAX).await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn test_report_replaced_per_date() {
        let repo = MemoryUsageRepository::new();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut report = DailyReport::from_records(date, &Vec::<UsageRecord>::new());
        repo.save_daily_report(&report).await.unwrap();
        report.total_requests = 42;
        repo.save_daily_report(&report).await.unwrap();

        assert_eq!(repo.report(date).unwrap().total_requests, 42);
    }
}

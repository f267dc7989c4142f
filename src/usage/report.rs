//! Daily usage report

use crate::events::Timestamp;
use crate::usage::record::{PerformanceStats, UsageRecord};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-provider totals for one calendar day (UTC), keyed by date when stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub generated_at: Timestamp,
    pub total_requests: u64,
    pub total_cost: f64,
    pub providers: BTreeMap<String, PerformanceStats>,
}

impl DailyReport {
    /// Aggregate the records of `date`; records from other days are ignored
    pub fn from_records<'a>(
        date: NaiveDate,
        records: impl IntoIterator<Item = &'a UsageRecord>,
    ) -> Self {
        let mut providers: BTreeMap<String, PerformanceStats> = BTreeMap::new();
        for record in records
            .into_iter()
            .filter(|record| record.timestamp.date_naive() == date)
        {
            providers
                .entry(record.provider.clone())
                .or_default()
                .update(record);
        }

        Self {
            date,
            generated_at: Utc::now(),
            total_requests: providers.values().map(|stats| stats.count).sum(),
            total_cost: providers.values().map(|stats| stats.total_cost).sum(),
            providers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests == 0
    }
}

//! Usage records and rolling per-provider statistics

use crate::events::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One call to an external compute provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub provider: String,
    pub timestamp: Timestamp,
    /// Kind of request sent to the provider, free text
    pub request_kind: String,
    pub input_size: u64,
    pub output_size: u64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub cost: f64,
    /// Whether the response produced a downstream decision
    pub produced_decision: bool,
    pub decision_quality: Option<f64>,
}

impl UsageRecord {
    /// A successful record stamped with the current time
    pub fn new(provider: impl Into<String>, request_kind: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            timestamp: Utc::now(),
            request_kind: request_kind.into(),
            input_size: 0,
            output_size: 0,
            duration_ms: 0,
            success: true,
            error: None,
            cost: 0.0,
            produced_decision: false,
            decision_quality: None,
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn sizes(mut self, input_size: u64, output_size: u64) -> Self {
        self.input_size = input_size;
        self.output_size = output_size;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Mark the record failed with an error message
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn decision(mut self, quality: Option<f64>) -> Self {
        self.produced_decision = true;
        self.decision_quality = quality;
        self
    }
}

/// Rolling statistics for one provider
///
/// Every field is folded in one record at a time; history is never
/// rescanned. Decision quality is averaged over the records that carry a
/// score, so it keeps its own sample count.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceStats {
    pub count: u64,
    pub success_rate: f64,
    pub avg_input_size: f64,
    pub avg_output_size: f64,
    pub avg_duration_ms: f64,
    pub total_cost: f64,
    pub decision_rate: f64,
    pub avg_decision_quality: Option<f64>,
    pub quality_samples: u64,
}

impl PerformanceStats {
    /// Fold a set of records into fresh statistics
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.update(record);
        }
        stats
    }

    /// Fold one record into the running aggregates
    pub fn update(&mut self, record: &UsageRecord) {
        let n = self.count as f64;
        self.success_rate = rolling(self.success_rate, n, flag(record.success));
        self.avg_input_size = rolling(self.avg_input_size, n, record.input_size as f64);
        self.avg_output_size = rolling(self.avg_output_size, n, record.output_size as f64);
        self.avg_duration_ms = rolling(self.avg_duration_ms, n, record.duration_ms as f64);
        self.decision_rate = rolling(self.decision_rate, n, flag(record.produced_decision));
        self.total_cost += record.cost;
        self.count += 1;

        if let Some(quality) = record.decision_quality {
            let previous = self.avg_decision_quality.unwrap_or(0.0);
            self.avg_decision_quality = Some(rolling(
                previous,
                self.quality_samples as f64,
                quality,
            ));
            self.quality_samples += 1;
        }
    }
}

/// (mean * n + value) / (n + 1)
fn rolling(mean: f64, n: f64, value: f64) -> f64 {
    (mean * n + value) / (n + 1.0)
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_duration_is_exact() {
        let mut stats = PerformanceStats::default();
        for duration in [1000, 2000, 3000] {
            stats.update(&UsageRecord::new("p", "analysis").duration_ms(duration));
        }
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg_duration_ms, 2000.0);
    }

    #[test]
    fn test_rates_and_totals() {
        let records = vec![
            UsageRecord::new("p", "analysis").cost(0.5).decision(Some(0.9)),
            UsageRecord::new("p", "analysis").cost(0.25).failed("timeout"),
            UsageRecord::new("p", "analysis").cost(0.25).decision(None),
            UsageRecord::new("p", "analysis").cost(1.0).decision(Some(0.5)),
        ];
        let stats = PerformanceStats::from_records(&records);

        assert_eq!(stats.count, 4);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert!((stats.decision_rate - 0.75).abs() < 1e-9);
        assert_eq!(stats.total_cost, 2.0);
        assert_eq!(stats.quality_samples, 2);
        let quality = stats.avg_decision_quality.unwrap();
        assert!((quality - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_sizes() {
        let records = vec![
            UsageRecord::new("p", "a").sizes(100, 10),
            UsageRecord::new("p", "a").sizes(300, 30),
        ];
        let stats = PerformanceStats::from_records(&records);
        assert_eq!(stats.avg_input_size, 200.0);
        assert_eq!(stats.avg_output_size, 20.0);
    }

    #[test]
    fn test_no_quality_scores() {
        let stats = PerformanceStats::from_records(&[UsageRecord::new("p", "a")]);
        assert_eq!(stats.avg_decision_quality, None);
        assert_eq!(stats.success_rate, 1.0);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    // The incremental mean agrees with the batch mean
    #[quickcheck]
    fn prop_rolling_mean_matches_batch_mean(durations: Vec<u16>) -> bool {
        if durations.is_empty() {
            return true;
        }
        let mut stats = PerformanceStats::default();
        for d in &durations {
            stats.update(&UsageRecord::new("p", "a").duration_ms(u64::from(*d)));
        }
        let batch = durations.iter().map(|d| f64::from(*d)).sum::<f64>() / durations.len() as f64;
        (stats.avg_duration_ms - batch).abs() < 1e-6 * batch.max(1.0)
    }

    #[quickcheck]
    fn prop_success_rate_is_a_rate(outcomes: Vec<bool>) -> bool {
        let mut stats = PerformanceStats::default();
        for success in &outcomes {
            let record = UsageRecord::new("p", "a");
            let record = if *success { record } else { record.failed("x") };
            stats.update(&record);
        }
        (0.0..=1.0).contains(&stats.success_rate) && stats.count == outcomes.len() as u64
    }
}

//! Lifetime latency percentiles backed by an HDR histogram.
//!
//! The fixed-bin [`crate::histogram::Histogram`] is what interval reports
//! carry; this collector only feeds the percentile summary of final reports.

use crate::error::{ReportError, Result};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Percentiles reported in final summaries.
pub const SUMMARY_PERCENTILES: [f64; 4] = [50.0, 90.0, 99.0, 99.9];

/// Largest trackable latency: one minute, in microseconds.
const MAX_TRACKABLE_US: u64 = 60_000_000;

/// Percentile value pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_us: u64,
}

/// Latency collector using an HDR histogram with microsecond resolution
#[derive(Debug, Clone)]
pub struct PercentileCollector {
    histogram: Histogram<u64>,
}

impl PercentileCollector {
    /// Create a collector with 3 significant figures up to one minute.
    pub fn new() -> Result<Self> {
        let histogram = Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_US, 3)
            .map_err(|e| ReportError::InvalidHistogram(e.to_string()))?;
        Ok(Self { histogram })
    }

    /// Record a latency in seconds.
    ///
    /// Negative values (tolerated skew inside the clock-sanity window) are
    /// recorded as zero; values past the trackable range saturate.
    pub fn record_seconds(&mut self, seconds: f64) {
        let us = (seconds * 1e6).round().max(0.0) as u64;
        self.histogram.saturating_record(us);
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn percentiles(&self, percentiles: &[f64]) -> Vec<PercentileValue> {
        if self.histogram.is_empty() {
            return Vec::new();
        }
        percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_us: self.histogram.value_at_percentile(p),
            })
            .collect()
    }

    pub fn summary(&self) -> Vec<PercentileValue> {
        self.percentiles(&SUMMARY_PERCENTILES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles_over_uniform_latencies() {
        let mut collector = PercentileCollector::new().unwrap();
        for ms in 1..=1000 {
            collector.record_seconds(ms as f64 * 1e-3);
        }
        assert_eq!(collector.len(), 1000);

        let summary = collector.summary();
        assert_eq!(summary.len(), 4);
        let p50 = summary[0].value_us as f64;
        let p99 = summary[2].value_us as f64;
        assert!((p50 - 500_000.0).abs() / 500_000.0 < 0.01, "p50 = {}", p50);
        assert!((p99 - 990_000.0).abs() / 990_000.0 < 0.01, "p99 = {}", p99);
    }

    #[test]
    fn test_negative_and_huge_values_are_clamped() {
        let mut collector = PercentileCollector::new().unwrap();
        collector.record_seconds(-0.5);
        collector.record_seconds(3600.0);
        assert_eq!(collector.len(), 2);
        assert!(PercentileCollector::new().unwrap().summary().is_empty());
    }
}

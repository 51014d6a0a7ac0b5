//! End-to-end latency ("transit") accumulator.
//!
//! Latency is `receive time - send time` and depends on two independent
//! clocks. Values outside the [`LatencyWindow`] are taken as evidence of
//! unsynchronised clocks: they are counted as `implausible` but kept out of
//! mean, variance, min and max, and the snapshot is flagged `unreliable`.

use super::percentile::{PercentileCollector, PercentileValue};
use super::{IntervalAccumulator, RunningStats};
use crate::defaults;
use serde::{Deserialize, Serialize};

/// Clock-sanity bounds, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyWindow {
    pub min: f64,
    pub max: f64,
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self {
            min: defaults::LATENCY_WINDOW_MIN,
            max: defaults::LATENCY_WINDOW_MAX,
        }
    }
}

impl LatencyWindow {
    pub fn contains(&self, seconds: f64) -> bool {
        seconds >= self.min && seconds <= self.max
    }
}

/// Latency statistics for one interval or for the whole stream.
///
/// All times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitSnapshot {
    /// Samples accepted into the statistics.
    pub count: u64,
    /// Samples rejected by the clock-sanity window.
    pub implausible: u64,
    pub mean: f64,
    pub variance: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub last: f64,
    pub unreliable: bool,
}

impl TransitSnapshot {
    fn from_parts(stats: &RunningStats, implausible: u64) -> Self {
        Self {
            count: stats.count(),
            implausible,
            mean: stats.mean(),
            variance: stats.variance(),
            stddev: stats.stddev(),
            min: stats.min(),
            max: stats.max(),
            sum: stats.sum(),
            last: stats.last(),
            unreliable: implausible > 0,
        }
    }

    /// Every sample seen, accepted or not.
    pub fn samples(&self) -> u64 {
        self.count + self.implausible
    }

    /// Pool two snapshots as if their samples had been accumulated together.
    pub fn combine(&self, other: &TransitSnapshot) -> TransitSnapshot {
        if other.count == 0 {
            return TransitSnapshot {
                implausible: self.implausible + other.implausible,
                unreliable: self.unreliable || other.unreliable,
                ..*self
            };
        }
        if self.count == 0 {
            return TransitSnapshot {
                implausible: self.implausible + other.implausible,
                unreliable: self.unreliable || other.unreliable,
                ..*other
            };
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;
        let m2 = self.variance * (n_a - 1.0)
            + other.variance * (n_b - 1.0)
            + delta * delta * n_a * n_b / n;
        let variance = if n > 1.0 { m2 / (n - 1.0) } else { 0.0 };

        TransitSnapshot {
            count: self.count + other.count,
            implausible: self.implausible + other.implausible,
            mean: self.mean + delta * n_b / n,
            variance,
            stddev: variance.sqrt(),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
            last: other.last,
            unreliable: self.unreliable || other.unreliable,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitStats {
    window: LatencyWindow,
    interval: RunningStats,
    total: RunningStats,
    interval_implausible: u64,
    total_implausible: u64,
    percentiles: Option<PercentileCollector>,
}

impl Default for TransitStats {
    fn default() -> Self {
        Self::new(LatencyWindow::default())
    }
}

impl TransitStats {
    pub fn new(window: LatencyWindow) -> Self {
        Self {
            window,
            interval: RunningStats::new(),
            total: RunningStats::new(),
            interval_implausible: 0,
            total_implausible: 0,
            percentiles: None,
        }
    }

    /// Also track lifetime HDR percentiles of accepted samples.
    pub fn with_percentiles(mut self, collector: PercentileCollector) -> Self {
        self.percentiles = Some(collector);
        self
    }

    pub fn window(&self) -> LatencyWindow {
        self.window
    }

    /// Record one latency; returns whether it passed the sanity window.
    pub fn record(&mut self, seconds: f64) -> bool {
        if !self.window.contains(seconds) {
            self.interval_implausible += 1;
            return false;
        }
        self.interval.push(seconds);
        if let Some(collector) = self.percentiles.as_mut() {
            collector.record_seconds(seconds);
        }
        true
    }

    /// Lifetime percentile summary, empty when percentiles are not tracked.
    pub fn percentile_summary(&self) -> Vec<PercentileValue> {
        self.percentiles
            .as_ref()
            .map(PercentileCollector::summary)
            .unwrap_or_default()
    }
}

impl IntervalAccumulator for TransitStats {
    type Sample = f64;
    type Snapshot = TransitSnapshot;

    fn update(&mut self, seconds: f64) {
        self.record(seconds);
    }

    fn interval(&self) -> TransitSnapshot {
        TransitSnapshot::from_parts(&self.interval, self.interval_implausible)
    }

    fn total(&self) -> TransitSnapshot {
        TransitSnapshot::from_parts(
            &self.total.merged(&self.interval),
            self.total_implausible + self.interval_implausible,
        )
    }

    fn merge_into_total(&mut self) {
        self.total.merge(&self.interval);
        self.total_implausible += self.interval_implausible;
    }

    fn reset_interval(&mut self) {
        self.interval = RunningStats::new();
        self.interval_implausible = 0;
    }
}

//! # Latency Histogram
//!
//! Fixed-bin frequency accumulator used for packet and frame latency
//! distributions. Only bucket counts are kept, so memory is bounded by the
//! bin count no matter how much traffic is measured.
//!
//! ## Bucket Placement
//!
//! A sample `v` lands in bucket `floor(v / bin_width)`. Samples below zero or
//! at/above `bin_count * bin_width` are not placed in a bucket; they increment
//! the below/above outlier counters instead, so that
//! `sum(bins) + outliers_below + outliers_above == samples` always holds.
//!
//! ## Confidence Interval Extraction
//!
//! The configured lower/upper percentiles are resolved by walking cumulative
//! counts from the below-range outliers, through the buckets, to the
//! above-range outliers. The reported value is the upper edge of the bucket in
//! which the target rank falls.
//!
//! Two accumulations run side by side: the interval one, cleared by
//! [`Histogram::reset_interval`], and the lifetime one, which never resets.

use crate::error::{ReportError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest bin count accepted, bounding the allocation per histogram.
pub const MAX_BIN_COUNT: usize = 1 << 20;

/// Unit the histogram bins are expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistogramUnits {
    #[default]
    Milliseconds,
    Microseconds,
}

impl HistogramUnits {
    /// Multiplier converting seconds into this unit.
    pub fn per_second(self) -> f64 {
        match self {
            HistogramUnits::Milliseconds => 1e3,
            HistogramUnits::Microseconds => 1e6,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            HistogramUnits::Milliseconds => "ms",
            HistogramUnits::Microseconds => "us",
        }
    }
}

impl fmt::Display for HistogramUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Shape of a latency histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    pub bin_width: f64,
    pub bin_count: usize,
    pub lower_ci_pct: f64,
    pub upper_ci_pct: f64,
    pub units: HistogramUnits,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            bin_width: crate::defaults::HISTOGRAM_BIN_WIDTH,
            bin_count: crate::defaults::HISTOGRAM_BIN_COUNT,
            lower_ci_pct: crate::defaults::HISTOGRAM_LOWER_CI,
            upper_ci_pct: crate::defaults::HISTOGRAM_UPPER_CI,
            units: HistogramUnits::Milliseconds,
        }
    }
}

impl HistogramConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bin_width.is_finite() && self.bin_width > 0.0) {
            return Err(ReportError::InvalidHistogram(format!(
                "bin width must be a positive number, got {}",
                self.bin_width
            )));
        }
        if self.bin_count == 0 || self.bin_count > MAX_BIN_COUNT {
            return Err(ReportError::InvalidHistogram(format!(
                "bin count must be between 1 and {}, got {}",
                MAX_BIN_COUNT, self.bin_count
            )));
        }
        let pct_ok = |p: f64| (0.0..=100.0).contains(&p);
        if !pct_ok(self.lower_ci_pct)
            || !pct_ok(self.upper_ci_pct)
            || self.lower_ci_pct > self.upper_ci_pct
        {
            return Err(ReportError::InvalidHistogram(format!(
                "confidence bounds must satisfy 0 <= lower <= upper <= 100, got {}/{}",
                self.lower_ci_pct, self.upper_ci_pct
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BinCounts {
    bins: Vec<u64>,
    samples: u64,
    outliers_below: u64,
    outliers_above: u64,
}

impl BinCounts {
    fn new(bin_count: usize) -> Self {
        Self {
            bins: vec![0; bin_count],
            samples: 0,
            outliers_below: 0,
            outliers_above: 0,
        }
    }

    fn clear(&mut self) {
        self.bins.iter_mut().for_each(|b| *b = 0);
        self.samples = 0;
        self.outliers_below = 0;
        self.outliers_above = 0;
    }
}

/// Plain-data view of a histogram handed to the output layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub name: String,
    pub units: HistogramUnits,
    pub bin_width: f64,
    pub bins: Vec<u64>,
    pub samples: u64,
    pub outliers_below: u64,
    pub outliers_above: u64,
    pub lower_ci_pct: f64,
    pub upper_ci_pct: f64,
    /// Value (in `units`) at the lower confidence percentile.
    pub lower_ci_value: Option<f64>,
    /// Value (in `units`) at the upper confidence percentile.
    pub upper_ci_value: Option<f64>,
}

impl HistogramSnapshot {
    /// `(bucket index, count)` for every populated bucket.
    pub fn populated_bins(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| (i, *count))
    }

    pub fn outliers(&self) -> u64 {
        self.outliers_below + self.outliers_above
    }

    /// Bucket-wise sum of two snapshots of the same shape, with the
    /// confidence interval recomputed over the combined counts.
    ///
    /// Snapshots of different shapes cannot be merged; `self` is returned.
    pub fn merged(&self, other: &HistogramSnapshot) -> HistogramSnapshot {
        if self.bins.len() != other.bins.len() || self.bin_width != other.bin_width {
            return self.clone();
        }
        let mut merged = self.clone();
        for (m, o) in merged.bins.iter_mut().zip(other.bins.iter()) {
            *m += o;
        }
        merged.samples += other.samples;
        merged.outliers_below += other.outliers_below;
        merged.outliers_above += other.outliers_above;
        merged.lower_ci_value = value_at_percentile(
            &merged.bins,
            merged.outliers_below,
            merged.samples,
            merged.bin_width,
            merged.lower_ci_pct,
        );
        merged.upper_ci_value = value_at_percentile(
            &merged.bins,
            merged.outliers_below,
            merged.samples,
            merged.bin_width,
            merged.upper_ci_pct,
        );
        merged
    }
}

/// Fixed-bin histogram with interval and lifetime accumulations.
#[derive(Debug, Clone)]
pub struct Histogram {
    name: String,
    config: HistogramConfig,
    interval: BinCounts,
    total: BinCounts,
}

impl Histogram {
    /// Create a histogram.
    ///
    /// ## Parameters
    /// - `name`: label carried into every snapshot (e.g. "T8" or "F8")
    /// - `bin_width`: width of one bucket, in `units`
    /// - `bin_count`: number of buckets
    /// - `lower_ci_pct` / `upper_ci_pct`: percentiles reported as the
    ///   confidence interval
    ///
    /// ## Errors
    /// `ReportError::InvalidHistogram` for a non-positive width, a bin count of
    /// zero (or above [`MAX_BIN_COUNT`]), or inverted/out-of-range percentiles.
    pub fn new(
        name: impl Into<String>,
        bin_width: f64,
        bin_count: usize,
        lower_ci_pct: f64,
        upper_ci_pct: f64,
        units: HistogramUnits,
    ) -> Result<Self> {
        Self::from_config(
            name,
            HistogramConfig {
                bin_width,
                bin_count,
                lower_ci_pct,
                upper_ci_pct,
                units,
            },
        )
    }

    pub fn from_config(name: impl Into<String>, config: HistogramConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            interval: BinCounts::new(config.bin_count),
            total: BinCounts::new(config.bin_count),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HistogramConfig {
        &self.config
    }

    /// Record one sample expressed in the histogram's units.
    pub fn add_sample(&mut self, value: f64) {
        let slot = self.bucket_of(value);
        for counts in [&mut self.interval, &mut self.total] {
            counts.samples += 1;
            match slot {
                Slot::Below => counts.outliers_below += 1,
                Slot::Above => counts.outliers_above += 1,
                Slot::Bin(i) => counts.bins[i] += 1,
            }
        }
    }

    /// Record a latency given in seconds.
    pub fn add_seconds(&mut self, seconds: f64) {
        self.add_sample(seconds * self.config.units.per_second());
    }

    /// Snapshot of the current interval.
    pub fn snapshot(&self) -> HistogramSnapshot {
        self.snapshot_of(&self.interval)
    }

    /// Snapshot of everything recorded since creation.
    pub fn total_snapshot(&self) -> HistogramSnapshot {
        self.snapshot_of(&self.total)
    }

    /// Clear the interval accumulation. The lifetime one is unaffected.
    pub fn reset_interval(&mut self) {
        self.interval.clear();
    }

    /// Snapshot the interval, then clear it.
    pub fn close_interval(&mut self) -> HistogramSnapshot {
        let snapshot = self.snapshot();
        self.reset_interval();
        snapshot
    }

    fn bucket_of(&self, value: f64) -> Slot {
        // NaN compares false everywhere and is treated as below range.
        if !(value >= 0.0) {
            return Slot::Below;
        }
        let index = (value / self.config.bin_width).floor();
        if index >= self.config.bin_count as f64 {
            Slot::Above
        } else {
            Slot::Bin(index as usize)
        }
    }

    fn snapshot_of(&self, counts: &BinCounts) -> HistogramSnapshot {
        HistogramSnapshot {
            name: self.name.clone(),
            units: self.config.units,
            bin_width: self.config.bin_width,
            bins: counts.bins.clone(),
            samples: counts.samples,
            outliers_below: counts.outliers_below,
            outliers_above: counts.outliers_above,
            lower_ci_pct: self.config.lower_ci_pct,
            upper_ci_pct: self.config.upper_ci_pct,
            lower_ci_value: value_at_percentile(
                &counts.bins,
                counts.outliers_below,
                counts.samples,
                self.config.bin_width,
                self.config.lower_ci_pct,
            ),
            upper_ci_value: value_at_percentile(
                &counts.bins,
                counts.outliers_below,
                counts.samples,
                self.config.bin_width,
                self.config.upper_ci_pct,
            ),
        }
    }
}

/// Upper edge of the bucket holding the `pct` percentile rank.
fn value_at_percentile(
    bins: &[u64],
    outliers_below: u64,
    samples: u64,
    bin_width: f64,
    pct: f64,
) -> Option<f64> {
    if samples == 0 {
        return None;
    }
    let target = ((samples as f64 * pct / 100.0).ceil() as u64).max(1);

    let mut cumulative = outliers_below;
    if cumulative >= target {
        return Some(0.0);
    }
    for (i, count) in bins.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return Some((i + 1) as f64 * bin_width);
        }
    }
    Some(bins.len() as f64 * bin_width)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Below,
    Bin(usize),
    Above,
}

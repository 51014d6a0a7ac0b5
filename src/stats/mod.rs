//! # Online Statistics
//!
//! Single-pass accumulators that turn per-packet events into interval and
//! lifetime metrics without retaining raw samples.
//!
//! Every accumulator keeps an *interval* accumulation and a *lifetime* one and
//! implements [`IntervalAccumulator`]:
//!
//! - `update` feeds one sample into the open interval
//! - `interval` / `total` produce snapshots; `total` includes the open
//!   interval without mutating anything
//! - `close_interval` snapshots the interval, folds it into the lifetime
//!   totals and resets the interval, in that order
//!
//! | Module | Accumulator | Sample |
//! |---|---|---|
//! | [`transit`] | end-to-end latency (Welford) | seconds |
//! | [`sockcall`] | read/write call counts, TCP info | bytes / write outcome |
//! | [`l2`] | link-layer validation outcomes | L2 flags |
//! | [`isoch`] | isochronous frame health | frame data |
//! | [`percentile`] | HDR latency percentiles (lifetime only) | seconds |

pub mod isoch;
pub mod l2;
pub mod percentile;
pub mod sockcall;
pub mod transit;

pub use isoch::{FrameAccounting, IsochSample, IsochSnapshot, IsochStats};
pub use l2::{L2Snapshot, L2Stats};
pub use percentile::{PercentileCollector, PercentileValue};
pub use sockcall::{ReadSnapshot, ReadStats, SockCallSnapshot, WriteOutcome, WriteSnapshot, WriteStats};
pub use transit::{LatencyWindow, TransitSnapshot, TransitStats};

/// Interval/lifetime accumulator contract shared by every statistic kind.
pub trait IntervalAccumulator {
    type Sample;
    type Snapshot;

    /// Feed one sample into the open interval.
    fn update(&mut self, sample: Self::Sample);

    /// Snapshot of the open interval.
    fn interval(&self) -> Self::Snapshot;

    /// Lifetime snapshot, open interval included.
    fn total(&self) -> Self::Snapshot;

    /// Fold the open interval into the lifetime totals.
    ///
    /// Must be followed by `reset_interval`, otherwise `total` counts the
    /// interval twice.
    fn merge_into_total(&mut self);

    /// Return the interval to its ready state.
    fn reset_interval(&mut self);

    /// Snapshot, fold and reset the interval.
    fn close_interval(&mut self) -> Self::Snapshot {
        let snapshot = self.interval();
        self.merge_into_total();
        self.reset_interval();
        snapshot
    }
}

/// Welford running mean/variance with min, max, sum and last value.
///
/// Two accumulations combine with the parallel form of the update (Chan et
/// al.), which is how interval values reach the lifetime totals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    sum: f64,
    last: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            last: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.last = value;
    }

    /// Fold `other` into `self` as if its samples had been pushed here.
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }

        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;

        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.last = other.last;
    }

    pub fn merged(&self, other: &RunningStats) -> RunningStats {
        let mut combined = *self;
        combined.merge(other);
        combined
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance `m2 / (n - 1)`; zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Smallest value seen, or 0 when empty.
    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Largest value seen, or 0 when empty.
    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

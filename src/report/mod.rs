//! # Report State
//!
//! Everything the reporter thread keeps per stream and per group, plus the
//! plain-data snapshots it hands to the output layer.
//!
//! - [`header::ReportHeader`]: one entry of the reporter's work list, owning
//!   the consumer end of a packet ring and the stream's [`data::ReporterData`]
//! - [`handler`]: the per-transport packet handlers that turn events into
//!   statistics updates
//! - [`multi::MultiHeader`]: shared state of a group of parallel streams
//!   (start barrier, reporter-ready signal, common start time)
//! - [`group::GroupSum`]: interval and final aggregation across a group
//!
//! [`TransferInfo`] and [`ConnectionInfo`] are what sinks see. They are
//! `Serialize` so that the JSON sink can write them unchanged.

pub mod data;
pub mod group;
pub mod handler;
pub mod header;
pub mod multi;

use crate::config::{Protocol, Role};
use crate::histogram::HistogramSnapshot;
use crate::stats::{
    IsochSnapshot, L2Snapshot, PercentileValue, SockCallSnapshot, TransitSnapshot,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    Interval,
    Final,
}

/// Whether a report describes one stream or the sum of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportScope {
    Stream,
    Sum,
}

/// Emitted once when the reporter adopts a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub stream_id: u64,
    pub group_id: Option<u64>,
    pub role: Role,
    pub protocol: Protocol,
    pub host: String,
    pub local_bind: Option<String>,
    pub interface: Option<String>,
    pub buffer_len: usize,
    pub mss: Option<u32>,
    pub window_size: Option<u32>,
    /// Target rate for UDP senders, bits per second.
    pub udp_rate: Option<f64>,
    pub isochronous: bool,
    pub enhanced: bool,
    pub l2_checks: bool,
}

/// One interval or final report, for a stream or a group sum.
///
/// `start` and `end` are seconds since the stream (or group) start. Counters
/// cover exactly the `[start, end]` span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub kind: ReportKind,
    pub scope: ReportScope,
    /// `None` for sum reports.
    pub stream_id: Option<u64>,
    pub group_id: Option<u64>,
    pub role: Role,
    pub protocol: Protocol,
    pub socket: i32,
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    /// Events that carried data.
    pub packets: u64,
    /// UDP datagrams accounted on the receiving side.
    pub datagrams: u64,
    /// Sequence gaps not explained by reordering.
    pub lost: u64,
    pub out_of_order: u64,
    /// RFC 1889 inter-arrival jitter, seconds.
    pub jitter: f64,
    pub transit: Option<TransitSnapshot>,
    pub sock_calls: SockCallSnapshot,
    pub l2: Option<L2Snapshot>,
    pub isoch: Option<IsochSnapshot>,
    pub frame_transit: Option<TransitSnapshot>,
    pub latency_histogram: Option<HistogramSnapshot>,
    pub frame_histogram: Option<HistogramSnapshot>,
    /// Inter-packet gaps observed and their sum in seconds.
    pub ipg_count: u64,
    pub ipg_sum: f64,
    /// Times the producer had to wait for ring space.
    pub await_count: u64,
    /// Events discarded by a non-blocking enqueue policy.
    pub dropped: u64,
    /// The reporter could not keep up with this stream.
    pub cpu_bound: bool,
    /// Lifetime latency percentiles, final reports only.
    pub percentiles: Vec<PercentileValue>,
    /// Number of streams folded into a sum report.
    pub members: usize,
}

impl TransferInfo {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Throughput over the report span; zero for an empty span.
    pub fn bits_per_second(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            self.bytes as f64 * 8.0 / duration
        } else {
            0.0
        }
    }

    pub fn packets_per_second(&self) -> f64 {
        let duration = self.duration();
        if duration > 0.0 {
            self.packets as f64 / duration
        } else {
            0.0
        }
    }

    /// Datagrams expected in this span: received plus lost.
    pub fn expected_datagrams(&self) -> u64 {
        self.datagrams + self.lost
    }

    pub fn lost_percent(&self) -> f64 {
        crate::utils::loss_percent(self.lost as i64, self.expected_datagrams() as i64)
    }

    /// Mean inter-packet gap in seconds.
    pub fn mean_ipg(&self) -> f64 {
        if self.ipg_count == 0 {
            0.0
        } else {
            self.ipg_sum / self.ipg_count as f64
        }
    }

    /// Fold another stream's report for the same span into this one.
    ///
    /// Counters add, the span widens, distributions pool. Jitter is summed
    /// here; callers averaging jitter divide by `members` afterwards.
    pub fn accumulate(&mut self, other: &TransferInfo) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
        self.bytes += other.bytes;
        self.packets += other.packets;
        self.datagrams += other.datagrams;
        self.lost += other.lost;
        self.out_of_order += other.out_of_order;
        self.jitter += other.jitter;
        self.transit = combine_option(self.transit, other.transit, |a, b| a.combine(b));
        self.sock_calls = self.sock_calls.combine(&other.sock_calls);
        self.l2 = combine_option(self.l2, other.l2, |a, b| a.combine(b));
        self.isoch = combine_option(self.isoch, other.isoch, |a, b| a.combine(b));
        self.frame_transit =
            combine_option(self.frame_transit, other.frame_transit, |a, b| a.combine(b));
        self.latency_histogram = match (self.latency_histogram.take(), &other.latency_histogram) {
            (Some(a), Some(b)) => Some(a.merged(b)),
            (a, b) => a.or_else(|| b.clone()),
        };
        self.frame_histogram = match (self.frame_histogram.take(), &other.frame_histogram) {
            (Some(a), Some(b)) => Some(a.merged(b)),
            (a, b) => a.or_else(|| b.clone()),
        };
        self.ipg_count += other.ipg_count;
        self.ipg_sum += other.ipg_sum;
        self.await_count += other.await_count;
        self.dropped += other.dropped;
        self.cpu_bound |= other.cpu_bound;
        self.members += other.members;
    }
}

fn combine_option<T: Copy>(a: Option<T>, b: Option<T>, f: impl Fn(&T, &T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(&a, &b)),
        (a, b) => a.or(b),
    }
}

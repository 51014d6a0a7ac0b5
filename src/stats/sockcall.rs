//! Socket call accounting: reads on the receiving side, writes on the
//! sending side.

use super::IntervalAccumulator;
use crate::packet::{PacketEvent, TcpInfoSample, WriteErr};
use serde::{Deserialize, Serialize};

/// Number of bytes-per-read buckets.
pub const READ_BIN_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSnapshot {
    pub binsize: u64,
    pub reads: u64,
    pub bins: [u64; READ_BIN_COUNT],
}

/// Read-call counter with an 8-bucket bytes-per-read histogram.
///
/// A read of `len > 0` bytes lands in bucket `(len - 1) / binsize`; reads
/// larger than the last bucket are clamped into it so that the buckets always
/// sum to the read count. Zero-length reads (end of stream) are ignored.
#[derive(Debug, Clone)]
pub struct ReadStats {
    binsize: u64,
    interval: ReadSnapshot,
    total: ReadSnapshot,
}

impl ReadStats {
    /// `binsize` is normally `buffer_len / 8`; zero is raised to 1.
    pub fn new(binsize: u64) -> Self {
        let binsize = binsize.max(1);
        let empty = ReadSnapshot {
            binsize,
            ..Default::default()
        };
        Self {
            binsize,
            interval: empty,
            total: empty,
        }
    }

    pub fn for_buffer_len(buffer_len: usize) -> Self {
        Self::new((buffer_len / READ_BIN_COUNT) as u64)
    }

    pub fn binsize(&self) -> u64 {
        self.binsize
    }

    fn bin_of(&self, len: u64) -> usize {
        (((len - 1) / self.binsize) as usize).min(READ_BIN_COUNT - 1)
    }
}

impl IntervalAccumulator for ReadStats {
    type Sample = u64;
    type Snapshot = ReadSnapshot;

    fn update(&mut self, len: u64) {
        if len == 0 {
            return;
        }
        let bin = self.bin_of(len);
        self.interval.reads += 1;
        self.interval.bins[bin] += 1;
    }

    fn interval(&self) -> ReadSnapshot {
        self.interval
    }

    fn total(&self) -> ReadSnapshot {
        let mut total = self.total;
        total.reads += self.interval.reads;
        for (t, i) in total.bins.iter_mut().zip(self.interval.bins.iter()) {
            *t += i;
        }
        total
    }

    fn merge_into_total(&mut self) {
        self.total = self.total();
    }

    fn reset_interval(&mut self) {
        self.interval = ReadSnapshot {
            binsize: self.binsize,
            ..Default::default()
        };
    }
}

/// Outcome of one write call as seen by the reporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub write_err: WriteErr,
    pub tcp_info: Option<TcpInfoSample>,
}

impl From<&PacketEvent> for WriteOutcome {
    fn from(event: &PacketEvent) -> Self {
        Self {
            write_err: event.write_err,
            tcp_info: event.tcp_info,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSnapshot {
    pub writes: u64,
    pub errors: u64,
    /// TCP retransmits attributed to this span.
    pub retries: u64,
    /// Most recent congestion window, bytes.
    pub cwnd: u32,
    /// Most recent smoothed RTT, microseconds.
    pub rtt_us: u32,
    pub mean_rtt_us: f64,
    /// Kernel TCP information was available for this span.
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct WriteCounts {
    writes: u64,
    errors: u64,
    retries: u64,
    rtt_sum: u64,
    rtt_samples: u64,
    sampled: bool,
}

/// Write-call counter with TCP retransmit, cwnd and RTT tracking.
///
/// The kernel reports retransmits cumulatively; the interval value is the
/// difference from the baseline captured at the previous interval close.
#[derive(Debug, Clone, Default)]
pub struct WriteStats {
    interval: WriteCounts,
    total: WriteCounts,
    cwnd: u32,
    rtt_us: u32,
    tcp_retry_latest: u64,
    last_tcp_retry: u64,
}

impl WriteStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn interval_retries(&self) -> u64 {
        self.tcp_retry_latest.saturating_sub(self.last_tcp_retry)
    }

    fn snapshot(&self, counts: &WriteCounts, retries: u64) -> WriteSnapshot {
        WriteSnapshot {
            writes: counts.writes,
            errors: counts.errors,
            retries,
            cwnd: self.cwnd,
            rtt_us: self.rtt_us,
            mean_rtt_us: if counts.rtt_samples == 0 {
                0.0
            } else {
                counts.rtt_sum as f64 / counts.rtt_samples as f64
            },
            up_to_date: counts.sampled,
        }
    }
}

impl IntervalAccumulator for WriteStats {
    type Sample = WriteOutcome;
    type Snapshot = WriteSnapshot;

    fn update(&mut self, outcome: WriteOutcome) {
        match outcome.write_err {
            WriteErr::None => self.interval.writes += 1,
            WriteErr::Account => {
                self.interval.writes += 1;
                self.interval.errors += 1;
            }
            WriteErr::Fatal => self.interval.errors += 1,
            WriteErr::NoAccount => {}
        }

        if let Some(info) = outcome.tcp_info {
            self.cwnd = info.cwnd;
            self.rtt_us = info.rtt_us;
            self.tcp_retry_latest = self.tcp_retry_latest.max(info.retransmits);
            self.interval.rtt_sum += u64::from(info.rtt_us);
            self.interval.rtt_samples += 1;
            self.interval.sampled = true;
        }
    }

    fn interval(&self) -> WriteSnapshot {
        self.snapshot(&self.interval, self.interval_retries())
    }

    fn total(&self) -> WriteSnapshot {
        let combined = WriteCounts {
            writes: self.total.writes + self.interval.writes,
            errors: self.total.errors + self.interval.errors,
            retries: self.total.retries + self.interval_retries(),
            rtt_sum: self.total.rtt_sum + self.interval.rtt_sum,
            rtt_samples: self.total.rtt_samples + self.interval.rtt_samples,
            sampled: self.total.sampled || self.interval.sampled,
        };
        self.snapshot(&combined, combined.retries)
    }

    fn merge_into_total(&mut self) {
        self.total.writes += self.interval.writes;
        self.total.errors += self.interval.errors;
        self.total.retries += self.interval_retries();
        self.total.rtt_sum += self.interval.rtt_sum;
        self.total.rtt_samples += self.interval.rtt_samples;
        self.total.sampled |= self.interval.sampled;
        self.last_tcp_retry = self.tcp_retry_latest;
    }

    fn reset_interval(&mut self) {
        self.interval = WriteCounts::default();
    }
}

/// Socket call statistics for the stream's role.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SockCallSnapshot {
    Read(ReadSnapshot),
    Write(WriteSnapshot),
}

impl SockCallSnapshot {
    pub fn as_read(&self) -> Option<&ReadSnapshot> {
        match self {
            SockCallSnapshot::Read(read) => Some(read),
            SockCallSnapshot::Write(_) => None,
        }
    }

    pub fn as_write(&self) -> Option<&WriteSnapshot> {
        match self {
            SockCallSnapshot::Write(write) => Some(write),
            SockCallSnapshot::Read(_) => None,
        }
    }

    /// Element-wise sum, used for group totals.
    pub fn combine(&self, other: &SockCallSnapshot) -> SockCallSnapshot {
        match (self, other) {
            (SockCallSnapshot::Read(a), SockCallSnapshot::Read(b)) => {
                let mut sum = *a;
                sum.reads += b.reads;
                for (s, x) in sum.bins.iter_mut().zip(b.bins.iter()) {
                    *s += x;
                }
                SockCallSnapshot::Read(sum)
            }
            (SockCallSnapshot::Write(a), SockCallSnapshot::Write(b)) => {
                let weight = |w: &WriteSnapshot| if w.up_to_date { 1.0 } else { 0.0 };
                let samples = weight(a) + weight(b);
                SockCallSnapshot::Write(WriteSnapshot {
                    writes: a.writes + b.writes,
                    errors: a.errors + b.errors,
                    retries: a.retries + b.retries,
                    cwnd: a.cwnd.max(b.cwnd),
                    rtt_us: a.rtt_us.max(b.rtt_us),
                    mean_rtt_us: if samples == 0.0 {
                        0.0
                    } else {
                        (a.mean_rtt_us * weight(a) + b.mean_rtt_us * weight(b)) / samples
                    },
                    up_to_date: a.up_to_date || b.up_to_date,
                })
            }
            (mixed, _) => *mixed,
        }
    }
}

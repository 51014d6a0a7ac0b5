//! Per-stream statistics state.
//!
//! `ReporterData` holds running counters with their interval shadows
//! (`last_*`, the value at the previous interval boundary), the accumulators
//! for every statistic the stream's settings enable, and the report clock.
//! It is owned by the reporter thread and never shared.

use super::{ConnectionInfo, ReportKind, ReportScope, TransferInfo};
use crate::config::{Role, StreamSettings};
use crate::defaults;
use crate::error::Result;
use crate::histogram::Histogram;
use crate::packet::Timestamp;
use crate::stats::{
    FrameAccounting, IntervalAccumulator, IsochStats, L2Stats, PercentileCollector, ReadStats,
    SockCallSnapshot, TransitStats, WriteStats,
};
use std::time::Duration;

/// Read statistics on the receiving side, write statistics on the sending
/// side.
#[derive(Debug, Clone)]
pub enum SockCallStats {
    Read(ReadStats),
    Write(WriteStats),
}

impl SockCallStats {
    fn total(&self) -> SockCallSnapshot {
        match self {
            SockCallStats::Read(read) => SockCallSnapshot::Read(read.total()),
            SockCallStats::Write(write) => SockCallSnapshot::Write(write.total()),
        }
    }

    fn close_interval(&mut self) -> SockCallSnapshot {
        match self {
            SockCallStats::Read(read) => SockCallSnapshot::Read(read.close_interval()),
            SockCallStats::Write(write) => SockCallSnapshot::Write(write.close_interval()),
        }
    }
}

/// Counter together with its value at the last interval boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shadowed<T> {
    pub current: T,
    pub last: T,
}

impl Shadowed<u64> {
    pub fn delta(&self) -> u64 {
        self.current.saturating_sub(self.last)
    }

    fn roll(&mut self) {
        self.last = self.current;
    }
}

#[derive(Debug)]
pub struct ReporterData {
    pub stream_id: u64,
    pub group_id: Option<u64>,
    pub settings: StreamSettings,
    pub socket: i32,

    pub bytes: Shadowed<u64>,
    pub packets: Shadowed<u64>,
    pub datagrams: Shadowed<u64>,
    /// Sequence gaps, counted when a packet id skips ahead.
    pub cnt_error: Shadowed<u64>,
    pub out_of_order: Shadowed<u64>,
    /// Highest packet id seen.
    pub packet_id: i64,

    pub jitter: f64,
    pub last_transit: Option<f64>,
    pub ipg_count: Shadowed<u64>,
    pub ipg_sum: f64,
    last_ipg_sum: f64,
    pub last_packet_time: Timestamp,

    pub start_time: Timestamp,
    pub interval_start: Timestamp,
    pub next_time: Timestamp,
    /// Time of the most recent event, data or empty.
    pub packet_time: Timestamp,

    pub transit: TransitStats,
    pub sock_calls: SockCallStats,
    pub l2: Option<L2Stats>,
    pub isoch: Option<IsochStats>,
    pub frame_transit: Option<TransitStats>,
    pub latency_histogram: Option<Histogram>,
    pub frame_histogram: Option<Histogram>,

    pub await_count: Shadowed<u64>,
    pub dropped: Shadowed<u64>,
}

impl ReporterData {
    /// Build the accumulators the settings ask for.
    ///
    /// ## Errors
    /// `ReportError::InvalidHistogram` when a histogram is configured with an
    /// invalid shape, or the HDR collector cannot be created.
    pub fn new(stream_id: u64, group_id: Option<u64>, mut settings: StreamSettings) -> Result<Self> {
        // The interval clock advances by whole intervals; a zero step never ends.
        settings.interval = settings
            .interval
            .map(|i| i.max(defaults::SMALLEST_INTERVAL));

        let mut transit = TransitStats::new(settings.latency_window);
        if settings.enhanced {
            transit = transit.with_percentiles(PercentileCollector::new()?);
        }

        let sock_calls = match settings.role {
            Role::Server => SockCallStats::Read(ReadStats::for_buffer_len(settings.buffer_len)),
            Role::Client => SockCallStats::Write(WriteStats::new()),
        };

        let accounting = match settings.role {
            Role::Server => FrameAccounting::Receiver,
            Role::Client => FrameAccounting::Sender,
        };
        let isoch = settings.isoch.map(|config| IsochStats::new(config, accounting));
        let frame_transit = isoch
            .as_ref()
            .map(|_| TransitStats::new(settings.latency_window));

        let (latency_histogram, frame_histogram) = match settings.histogram {
            Some(config) => {
                let latency =
                    Histogram::from_config(format!("T{}", stream_id), config)?;
                let frame = if isoch.is_some() {
                    Some(Histogram::from_config(format!("F{}", stream_id), config)?)
                } else {
                    None
                };
                (Some(latency), frame)
            }
            None => (None, None),
        };

        Ok(Self {
            stream_id,
            group_id,
            socket: -1,
            bytes: Shadowed::default(),
            packets: Shadowed::default(),
            datagrams: Shadowed::default(),
            cnt_error: Shadowed::default(),
            out_of_order: Shadowed::default(),
            packet_id: 0,
            jitter: 0.0,
            last_transit: None,
            ipg_count: Shadowed::default(),
            ipg_sum: 0.0,
            last_ipg_sum: 0.0,
            last_packet_time: Timestamp::ZERO,
            start_time: Timestamp::ZERO,
            interval_start: Timestamp::ZERO,
            next_time: Timestamp::ZERO,
            packet_time: Timestamp::ZERO,
            transit,
            sock_calls,
            l2: if settings.l2_checks { Some(L2Stats::new()) } else { None },
            isoch,
            frame_transit,
            latency_histogram,
            frame_histogram,
            await_count: Shadowed::default(),
            dropped: Shadowed::default(),
            settings,
        })
    }

    pub fn is_started(&self) -> bool {
        self.start_time.is_set()
    }

    /// Fix the stream epoch and arm the first interval boundary.
    pub fn start(&mut self, start_time: Timestamp) {
        self.start_time = start_time;
        self.interval_start = start_time;
        self.packet_time = start_time;
        if let Some(interval) = self.settings.interval {
            self.next_time = start_time + interval;
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.settings.interval
    }

    /// Whether an event at `t` lies past the open interval's end.
    pub fn interval_due(&self, t: Timestamp) -> bool {
        self.settings.interval.is_some() && self.next_time.is_set() && t >= self.next_time
    }

    /// Whether anything happened since the last interval boundary.
    pub fn has_open_interval(&self) -> bool {
        self.packet_time > self.interval_start
    }

    /// Update the producer-side counters published by the ring.
    pub fn observe_ring(&mut self, await_count: u64, dropped: u64) {
        self.await_count.current = await_count;
        self.dropped.current = dropped;
    }

    fn connection_scope(&self) -> (Option<u64>, Option<u64>) {
        (Some(self.stream_id), self.group_id)
    }

    /// Lost datagrams over a span: new gaps minus reordered packets that
    /// filled earlier gaps.
    fn lost(cnt_error: u64, out_of_order: u64) -> u64 {
        cnt_error.saturating_sub(out_of_order)
    }

    /// Close the open interval at `end` and advance the clock.
    ///
    /// Counters and accumulators are snapshotted then reset, and the next
    /// boundary moves one interval forward from the previous one so that
    /// interval edges never drift.
    pub fn close_interval(&mut self, end: Timestamp, cpu_bound: bool) -> TransferInfo {
        let (stream_id, group_id) = self.connection_scope();
        let transit_enabled = self.transit_enabled();
        let transit = self.transit.close_interval();
        let info = TransferInfo {
            kind: ReportKind::Interval,
            scope: ReportScope::Stream,
            stream_id,
            group_id,
            role: self.settings.role,
            protocol: self.settings.protocol,
            socket: self.socket,
            start: self.interval_start.seconds_since(self.start_time),
            end: end.seconds_since(self.start_time),
            bytes: self.bytes.delta(),
            packets: self.packets.delta(),
            datagrams: self.datagrams.delta(),
            lost: Self::lost(self.cnt_error.delta(), self.out_of_order.delta()),
            out_of_order: self.out_of_order.delta(),
            jitter: self.jitter,
            transit: transit_enabled.then_some(transit),
            sock_calls: self.sock_calls.close_interval(),
            l2: self.l2.as_mut().map(IntervalAccumulator::close_interval),
            isoch: self.isoch.as_mut().map(IntervalAccumulator::close_interval),
            frame_transit: self
                .frame_transit
                .as_mut()
                .map(IntervalAccumulator::close_interval),
            latency_histogram: self.latency_histogram.as_mut().map(Histogram::close_interval),
            frame_histogram: self.frame_histogram.as_mut().map(Histogram::close_interval),
            ipg_count: self.ipg_count.delta(),
            ipg_sum: self.ipg_sum - self.last_ipg_sum,
            await_count: self.await_count.delta(),
            dropped: self.dropped.delta(),
            cpu_bound,
            percentiles: Vec::new(),
            members: 1,
        };

        for counter in [
            &mut self.bytes,
            &mut self.packets,
            &mut self.datagrams,
            &mut self.cnt_error,
            &mut self.out_of_order,
            &mut self.ipg_count,
            &mut self.await_count,
            &mut self.dropped,
        ] {
            counter.roll();
        }
        self.last_ipg_sum = self.ipg_sum;

        self.interval_start = end;
        if let Some(interval) = self.settings.interval {
            while self.next_time <= end {
                self.next_time = self.next_time + interval;
            }
        }
        info
    }

    /// Lifetime report from the stream start to the last event.
    pub fn final_report(&self, cpu_bound: bool) -> TransferInfo {
        let (stream_id, group_id) = self.connection_scope();
        TransferInfo {
            kind: ReportKind::Final,
            scope: ReportScope::Stream,
            stream_id,
            group_id,
            role: self.settings.role,
            protocol: self.settings.protocol,
            socket: self.socket,
            start: 0.0,
            end: self.packet_time.seconds_since(self.start_time).max(0.0),
            bytes: self.bytes.current,
            packets: self.packets.current,
            datagrams: self.datagrams.current,
            lost: Self::lost(self.cnt_error.current, self.out_of_order.current),
            out_of_order: self.out_of_order.current,
            jitter: self.jitter,
            transit: self.transit_enabled().then(|| self.transit.total()),
            sock_calls: self.sock_calls.total(),
            l2: self.l2.as_ref().map(IntervalAccumulator::total),
            isoch: self.isoch.as_ref().map(IntervalAccumulator::total),
            frame_transit: self.frame_transit.as_ref().map(IntervalAccumulator::total),
            latency_histogram: self.latency_histogram.as_ref().map(Histogram::total_snapshot),
            frame_histogram: self.frame_histogram.as_ref().map(Histogram::total_snapshot),
            ipg_count: self.ipg_count.current,
            ipg_sum: self.ipg_sum,
            await_count: self.await_count.current,
            dropped: self.dropped.current,
            cpu_bound,
            percentiles: self.transit.percentile_summary(),
            members: 1,
        }
    }

    /// Latency is reported by receivers and by any stream whose events carried
    /// a sender timestamp.
    fn transit_enabled(&self) -> bool {
        self.settings.role == Role::Server || self.transit.total().samples() > 0
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let s = &self.settings;
        ConnectionInfo {
            stream_id: self.stream_id,
            group_id: self.group_id,
            role: s.role,
            protocol: s.protocol,
            host: s.host.clone(),
            local_bind: s.local_bind.clone(),
            interface: s.interface.clone(),
            buffer_len: s.buffer_len,
            mss: s.mss,
            window_size: s.window_size,
            udp_rate: s.udp_rate,
            isochronous: s.is_isochronous(),
            enhanced: s.enhanced,
            l2_checks: s.l2_checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::histogram::HistogramConfig;

    fn ms(t: i64) -> Timestamp {
        Timestamp::from_nanos(1_000_000_000_000 + t * 1_000_000)
    }

    fn udp_server() -> StreamSettings {
        StreamSettings::new(Role::Server, Protocol::Udp).with_interval(Some(Duration::from_secs(1)))
    }

    #[test]
    fn test_accumulators_follow_settings() {
        let plain = ReporterData::new(1, None, udp_server()).unwrap();
        assert!(plain.l2.is_none());
        assert!(plain.isoch.is_none());
        assert!(plain.latency_histogram.is_none());
        assert!(matches!(plain.sock_calls, SockCallStats::Read(_)));

        let settings = udp_server()
            .with_l2_checks(true)
            .with_isoch(Some(Default::default()))
            .with_histogram(Some(HistogramConfig::default()));
        let full = ReporterData::new(7, Some(2), settings).unwrap();
        assert!(full.l2.is_some());
        assert!(full.frame_transit.is_some());
        assert_eq!(full.latency_histogram.as_ref().map(Histogram::name), Some("T7"));
        assert_eq!(full.frame_histogram.as_ref().map(Histogram::name), Some("F7"));

        let client = ReporterData::new(
            1,
            None,
            StreamSettings::new(Role::Client, Protocol::Tcp),
        )
        .unwrap();
        assert!(matches!(client.sock_calls, SockCallStats::Write(_)));
    }

    #[test]
    fn test_interval_clock() {
        let mut data = ReporterData::new(1, None, udp_server()).unwrap();
        assert!(!data.is_started());
        data.start(ms(0));
        assert!(!data.interval_due(ms(999)));
        assert!(data.interval_due(ms(1000)));

        data.packet_time = ms(500);
        data.bytes.current = 1000;
        let first = data.close_interval(ms(1000), false);
        assert_eq!(first.start, 0.0);
        assert_eq!(first.end, 1.0);
        assert_eq!(first.bytes, 1000);
        assert_eq!(data.next_time, ms(2000));

        data.bytes.current = 1500;
        let second = data.close_interval(ms(2000), false);
        assert_eq!(second.bytes, 500);
        assert_eq!(second.start, 1.0);

        let total = data.final_report(false);
        assert_eq!(total.bytes, 1500);
        assert_eq!(total.kind, ReportKind::Final);
    }

    #[test]
    fn test_zero_interval_is_raised_to_smallest() {
        let mut settings = udp_server();
        settings.interval = Some(Duration::ZERO);
        let mut data = ReporterData::new(1, None, settings).unwrap();
        assert_eq!(data.interval(), Some(defaults::SMALLEST_INTERVAL));

        data.start(ms(0));
        data.close_interval(ms(1000), false);
        assert_eq!(data.next_time, ms(1005));
    }

    #[test]
    fn test_interval_lost_subtracts_reordering() {
        let mut data = ReporterData::new(1, None, udp_server()).unwrap();
        data.start(ms(0));
        data.cnt_error.current = 5;
        data.out_of_order.current = 2;
        assert_eq!(data.close_interval(ms(1000), false).lost, 3);

        // More reordering than new gaps clamps at zero.
        data.out_of_order.current = 4;
        assert_eq!(data.close_interval(ms(2000), false).lost, 0);
        assert_eq!(data.final_report(false).lost, 1);
    }
}

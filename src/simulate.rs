//! # Synthetic Traffic
//!
//! [`SyntheticSource`] stands in for the socket layer. It produces the
//! [`PacketEvent`]s a real traffic thread would post for a stream with the
//! given [`StreamSettings`]:
//!
//! - UDP senders: rate-paced writes with increasing sequence ids
//! - UDP receivers: the same datagrams as seen after the path, with
//!   log-normal one-way latency, clock skew, loss and reordering applied
//! - TCP senders: fixed-size writes carrying TCP-info samples
//! - TCP receivers: reads carrying the sender's timestamp
//! - isochronous streams: one burst per frame, burst sizes drawn from a
//!   log-normal distribution around the configured mean load
//!
//! Events can be produced as fast as the reporter accepts them
//! ([`Pacing::Virtual`], used by tests) or paced against the wall clock
//! ([`Pacing::RealTime`], used by the binary).

use crate::config::{Protocol, Role, StreamSettings};
use crate::packet::{IsochFrame, PacketEvent, TcpInfoSample, Timestamp};
use crate::reporter::StreamReporter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Line rate assumed for TCP streams, bits per second.
const SIMULATED_LINK_RATE: f64 = 1_000_000_000.0;

/// Shape parameter of the one-way latency distribution.
const LATENCY_SIGMA: f64 = 0.25;

/// Nominal congestion window reported in TCP-info samples.
const SIMULATED_CWND: u32 = 64 * 1024;

/// Sleeps shorter than this are skipped when pacing against the clock.
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Parameters of the synthetic path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationConfig {
    pub duration: Duration,
    /// Mean one-way latency, seconds.
    pub mean_latency: f64,
    /// Receiver clock minus sender clock, seconds.
    pub clock_skew: f64,
    /// Percentage of datagrams lost on the path.
    pub loss_pct: f64,
    /// Percentage of datagrams delivered after their successor.
    pub reorder_pct: f64,
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration: crate::defaults::DURATION,
            mean_latency: 0.0005,
            clock_skew: 0.0,
            loss_pct: 0.0,
            reorder_pct: 0.0,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Sleep so that events are posted when their timestamps come due.
    RealTime,
    /// Post events back to back.
    Virtual,
}

/// Counters of one [`SyntheticSource::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub posted: u64,
    /// Events the stream refused (full ring under a dropping policy, or a
    /// test shutting down).
    pub rejected: u64,
    pub bytes: u64,
}

/// One write on the sending side, before the path is applied.
#[derive(Debug, Clone, Copy)]
struct Transmission {
    packet_id: i64,
    len: u64,
    /// Seconds since the source's start.
    offset: f64,
    isoch: Option<IsochFrame>,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameState {
    frame_id: i64,
    remaining: u64,
    burst_size: u64,
    next_packet_offset: f64,
}

#[derive(Debug)]
pub struct SyntheticSource {
    settings: StreamSettings,
    config: SimulationConfig,
    rng: StdRng,
    socket: i32,
    start: Timestamp,
    next_offset: f64,
    last_offset: f64,
    next_id: i64,
    frame: FrameState,
    retransmits: u64,
    lost: u64,
    held: Option<PacketEvent>,
    ready: VecDeque<PacketEvent>,
}

impl SyntheticSource {
    /// Source for the `stream_index`th stream of a test. With a seed, each
    /// stream gets its own deterministic sequence.
    pub fn new(settings: StreamSettings, config: SimulationConfig, stream_index: u64) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream_index)),
            None => StdRng::from_entropy(),
        };
        let first_id = if settings.protocol == Protocol::Udp { 1 } else { 0 };
        Self {
            settings,
            config,
            rng,
            socket: 3 + stream_index as i32,
            start: Timestamp::now(),
            next_offset: 0.0,
            last_offset: 0.0,
            next_id: first_id,
            frame: FrameState::default(),
            retransmits: 0,
            lost: 0,
            held: None,
            ready: VecDeque::new(),
        }
    }

    /// Sender clock reading of the first write.
    pub fn with_start(mut self, start: Timestamp) -> Self {
        self.start = start;
        self
    }

    /// Datagrams dropped on the path so far.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    fn receiving(&self) -> bool {
        self.settings.role == Role::Server
    }

    fn rate(&self) -> f64 {
        match self.settings.protocol {
            Protocol::Udp => self.settings.udp_rate.unwrap_or(crate::defaults::UDP_RATE),
            Protocol::Tcp => SIMULATED_LINK_RATE,
        }
    }

    fn roll(&mut self, pct: f64) -> bool {
        pct > 0.0 && self.rng.gen_bool((pct / 100.0).clamp(0.0, 1.0))
    }

    /// Box-Muller standard normal draw.
    fn standard_normal(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Log-normal draw with the given mean and standard deviation.
    fn log_normal(&mut self, mean: f64, stddev: f64) -> f64 {
        if mean <= 0.0 {
            return 0.0;
        }
        let sigma = (1.0 + (stddev / mean).powi(2)).ln().sqrt();
        let mu = mean.ln() - sigma * sigma / 2.0;
        (mu + sigma * self.standard_normal()).exp()
    }

    fn latency(&mut self) -> f64 {
        let mean = self.config.mean_latency;
        self.log_normal(mean, mean * LATENCY_SIGMA)
    }

    fn next_send(&mut self) -> Option<Transmission> {
        let duration = self.config.duration.as_secs_f64();
        let send = match self.settings.isoch {
            Some(isoch) if isoch.fps == 0 => return None,
            Some(isoch) => {
                if self.frame.remaining == 0 {
                    let frame_id = self.frame.frame_id + 1;
                    let frame_offset = (frame_id - 1) as f64 * isoch.burst_interval();
                    if frame_offset >= duration {
                        return None;
                    }
                    let stddev = isoch.variance / 8.0 / isoch.fps as f64;
                    let bytes = self
                        .log_normal(isoch.mean_frame_bytes(), stddev)
                        .round()
                        .max(1.0) as u64;
                    self.frame = FrameState {
                        frame_id,
                        remaining: bytes,
                        burst_size: bytes,
                        next_packet_offset: frame_offset,
                    };
                }
                let len = (self.settings.buffer_len as u64).min(self.frame.remaining);
                self.frame.remaining -= len;
                let offset = self.frame.next_packet_offset;
                self.frame.next_packet_offset += isoch.burst_ipg;
                Transmission {
                    packet_id: self.next_id,
                    len,
                    offset,
                    isoch: Some(IsochFrame {
                        frame_id: self.frame.frame_id,
                        prev_frame_id: self.frame.frame_id - 1,
                        burst_size: self.frame.burst_size as i64,
                        burst_period: (isoch.burst_interval() * 1e6).round() as i64,
                        start_time: self.start,
                        remaining: self.frame.remaining as i64,
                    }),
                }
            }
            None => {
                if self.next_offset >= duration {
                    return None;
                }
                let len = self.settings.buffer_len as u64;
                let offset = self.next_offset;
                self.next_offset += len as f64 * 8.0 / self.rate();
                Transmission {
                    packet_id: self.next_id,
                    len,
                    offset,
                    isoch: None,
                }
            }
        };
        if self.next_id > 0 {
            self.next_id += 1;
        }
        self.last_offset = send.offset;
        Some(send)
    }

    fn at(&self, offset: f64) -> Timestamp {
        Timestamp::from_nanos(self.start.as_nanos() + (offset * 1e9).round() as i64)
    }

    fn event_for(&mut self, send: &Transmission) -> PacketEvent {
        let sent = self.at(send.offset);
        let mut event = if self.receiving() {
            let transit = self.latency() + self.config.clock_skew;
            let received = self.at(send.offset + transit);
            PacketEvent::datagram(send.packet_id, send.len, sent, received)
        } else {
            PacketEvent::transfer(send.packet_id, send.len, sent)
        };
        if self.settings.protocol == Protocol::Tcp && !self.receiving() {
            if self.roll(self.config.loss_pct) {
                self.retransmits += 1;
            }
            let rtt = 2.0 * self.config.mean_latency;
            event = event.with_tcp_info(TcpInfoSample {
                retransmits: self.retransmits,
                cwnd: SIMULATED_CWND,
                rtt_us: (rtt * 1e6).round() as u32,
            });
        }
        if let Some(frame) = send.isoch {
            event = event.with_isoch(frame);
        }
        event.with_socket(self.socket)
    }

    /// Post every event of the stream, then return. The stream is left open;
    /// closing it is up to the caller.
    pub fn run(
        &mut self,
        stream: &mut StreamReporter,
        pacing: Pacing,
        interrupted: &AtomicBool,
    ) -> SourceSummary {
        let mut summary = SourceSummary::default();
        let wall_start = Instant::now();

        while let Some(event) = self.next() {
            if interrupted.load(Ordering::Acquire) {
                break;
            }
            if pacing == Pacing::RealTime {
                let due = Duration::from_secs_f64(self.last_offset.max(0.0));
                let elapsed = wall_start.elapsed();
                if due > elapsed + MIN_SLEEP {
                    thread::sleep(due - elapsed);
                }
            }
            let len = event.packet_len;
            if stream.report_packet(event) {
                summary.posted += 1;
                summary.bytes += len;
            } else {
                summary.rejected += 1;
            }
        }

        debug!(
            "stream {}: posted {} events ({} bytes), {} rejected, {} lost on path",
            stream.stream_id(),
            summary.posted,
            summary.bytes,
            summary.rejected,
            self.lost
        );
        summary
    }
}

impl Iterator for SyntheticSource {
    type Item = PacketEvent;

    /// Next event in posting order, with loss and reordering applied on the
    /// receiving side of UDP streams.
    fn next(&mut self) -> Option<PacketEvent> {
        if let Some(event) = self.ready.pop_front() {
            return Some(event);
        }
        let path_effects = self.receiving() && self.settings.protocol == Protocol::Udp;

        while let Some(send) = self.next_send() {
            if path_effects && self.roll(self.config.loss_pct) {
                self.lost += 1;
                continue;
            }
            let event = self.event_for(&send);
            if path_effects && self.held.is_none() && self.roll(self.config.reorder_pct) {
                self.held = Some(event);
                continue;
            }
            if let Some(held) = self.held.take() {
                self.ready.push_back(held);
            }
            return Some(event);
        }
        self.held.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsochConfig;
    use crate::output::MemorySink;
    use crate::report::{ReportKind, ReportScope};
    use crate::reporter::{Reporter, TestContext};
    use std::sync::Arc;

    fn config(seconds: u64) -> SimulationConfig {
        SimulationConfig {
            duration: Duration::from_secs(seconds),
            seed: Some(42),
            ..Default::default()
        }
    }

    fn udp_server() -> StreamSettings {
        StreamSettings::new(Role::Server, Protocol::Udp).with_udp_rate(Some(1_000_000.0))
    }

    #[test]
    fn test_udp_datagrams_are_paced_and_sequenced() {
        let events: Vec<_> = SyntheticSource::new(udp_server(), config(1), 0).collect();

        // 1 Mbit/s of 1470 byte datagrams for one second.
        let expected = (1_000_000.0 / (1470.0 * 8.0)) as usize;
        assert!(events.len() >= expected && events.len() <= expected + 1);
        assert!(events.windows(2).all(|w| w[1].packet_id == w[0].packet_id + 1));
        assert_eq!(events[0].packet_id, 1);
        assert!(events.iter().all(|e| e.transit().unwrap() > 0.0));
    }

    #[test]
    fn test_loss_skips_sequence_ids() {
        let sim = SimulationConfig {
            loss_pct: 20.0,
            ..config(2)
        };
        let mut source = SyntheticSource::new(udp_server(), sim, 0);
        let events: Vec<_> = source.by_ref().collect();
        let last_id = events.last().unwrap().packet_id as u64;

        assert!(source.lost() > 0);
        assert!(events.len() as u64 + source.lost() >= last_id);
        assert!(events.windows(2).any(|w| w[1].packet_id > w[0].packet_id + 1));
    }

    #[test]
    fn test_reorder_delivers_after_successor() {
        let sim = SimulationConfig {
            reorder_pct: 30.0,
            ..config(1)
        };
        let events: Vec<_> = SyntheticSource::new(udp_server(), sim, 0).collect();
        let mut ids: Vec<i64> = events.iter().map(|e| e.packet_id).collect();

        assert!(ids.windows(2).any(|w| w[1] < w[0]));
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), events.len());
    }

    #[test]
    fn test_clock_skew_shifts_transit() {
        let sim = SimulationConfig {
            clock_skew: -5.0,
            ..config(1)
        };
        let events: Vec<_> = SyntheticSource::new(udp_server(), sim, 0).collect();
        assert!(events.iter().all(|e| e.transit().unwrap() < -4.9));
    }

    #[test]
    fn test_tcp_client_writes_carry_tcp_info() {
        let settings = StreamSettings::new(Role::Client, Protocol::Tcp);
        let sim = SimulationConfig {
            duration: Duration::from_millis(10),
            ..config(0)
        };
        let events: Vec<_> = SyntheticSource::new(settings, sim, 1).collect();

        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.packet_id == 0 && e.tcp_info.is_some()));
        assert!(events.iter().all(|e| e.socket == 4));
        assert!(!events[0].sent_time.is_set());
    }

    #[test]
    fn test_isochronous_bursts_close_each_frame() {
        let settings = udp_server().with_isoch(Some(IsochConfig {
            fps: 10,
            mean: 1_000_000.0,
            variance: 100_000.0,
            ..Default::default()
        }));
        let events: Vec<_> = SyntheticSource::new(settings, config(1), 0).collect();

        let frames: Vec<_> = events.iter().filter_map(|e| e.isoch).collect();
        assert_eq!(frames.len(), events.len());
        assert_eq!(frames.iter().filter(|f| f.remaining == 0).count(), 10);
        assert_eq!(frames.last().unwrap().frame_id, 10);
        let bytes: u64 = events.iter().map(|e| e.packet_len).sum();
        assert!(bytes > 0);
    }

    #[test]
    fn test_run_feeds_reporter() {
        let context = Arc::new(TestContext::new());
        let sink = MemorySink::new();
        let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone())).unwrap();
        let mut stream = reporter.register_stream(udp_server(), None).unwrap();

        let mut source = SyntheticSource::new(udp_server(), config(1), 0);
        let summary = source.run(&mut stream, Pacing::Virtual, &context.interrupt_flag());
        stream.close();
        reporter.shutdown();
        reporter.join().unwrap();

        assert_eq!(summary.rejected, 0);
        let finals = sink.transfers_where(ReportScope::Stream, ReportKind::Final);
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].bytes, summary.bytes);
        assert_eq!(finals[0].datagrams, summary.posted);
        assert_eq!(finals[0].lost, 0);
    }
}

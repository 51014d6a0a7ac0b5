//! Packet handlers.
//!
//! A handler applies one [`PacketEvent`] to a stream's [`ReporterData`]. The
//! handler is chosen once, when the stream is registered, from its protocol
//! and isochronous mode; the reporter then calls it for every event without
//! looking at the settings again.
//!
//! | Handler | Stream |
//! |---|---|
//! | [`TcpHandler`] | TCP, either role |
//! | [`UdpHandler`] | UDP, either role |
//! | [`IsochUdpHandler`] | UDP carrying isochronous frames |

use super::data::{ReporterData, SockCallStats};
use crate::config::{Protocol, Role, StreamSettings};
use crate::packet::PacketEvent;
use crate::stats::{IntervalAccumulator, IsochSample, WriteOutcome};

/// Jitter smoothing divisor from RFC 1889.
const JITTER_GAIN: f64 = 16.0;

pub trait PacketHandler {
    /// Account one data-carrying event.
    fn handle(&mut self, data: &mut ReporterData, event: &PacketEvent);

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpHandler {
    role: Role,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpHandler {
    role: Role,
}

#[derive(Debug, Clone, Copy)]
pub struct IsochUdpHandler {
    udp: UdpHandler,
}

/// Closed set of handlers, dispatched without a vtable.
#[derive(Debug, Clone, Copy)]
pub enum StreamHandler {
    Tcp(TcpHandler),
    Udp(UdpHandler),
    UdpIsochronous(IsochUdpHandler),
}

impl StreamHandler {
    pub fn for_settings(settings: &StreamSettings) -> Self {
        let role = settings.role;
        match settings.protocol {
            Protocol::Tcp => StreamHandler::Tcp(TcpHandler { role }),
            Protocol::Udp if settings.is_isochronous() => {
                StreamHandler::UdpIsochronous(IsochUdpHandler {
                    udp: UdpHandler { role },
                })
            }
            Protocol::Udp => StreamHandler::Udp(UdpHandler { role }),
        }
    }
}

impl PacketHandler for StreamHandler {
    fn handle(&mut self, data: &mut ReporterData, event: &PacketEvent) {
        match self {
            StreamHandler::Tcp(h) => h.handle(data, event),
            StreamHandler::Udp(h) => h.handle(data, event),
            StreamHandler::UdpIsochronous(h) => h.handle(data, event),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            StreamHandler::Tcp(h) => h.name(),
            StreamHandler::Udp(h) => h.name(),
            StreamHandler::UdpIsochronous(h) => h.name(),
        }
    }
}

impl PacketHandler for TcpHandler {
    fn handle(&mut self, data: &mut ReporterData, event: &PacketEvent) {
        account_transfer(data, event);
        account_socket_call(data, event);
        if self.role == Role::Server {
            account_transit(data, event);
        }
        account_isoch(data, event);
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl PacketHandler for UdpHandler {
    fn handle(&mut self, data: &mut ReporterData, event: &PacketEvent) {
        account_transfer(data, event);
        account_socket_call(data, event);
        account_ipg(data, event);

        if self.role == Role::Server {
            account_transit(data, event);
            account_sequence(data, event);
            data.datagrams.current += 1;
            if let Some(l2) = data.l2.as_mut() {
                l2.update(event.l2_errors);
            }
        }
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

impl PacketHandler for IsochUdpHandler {
    fn handle(&mut self, data: &mut ReporterData, event: &PacketEvent) {
        self.udp.handle(data, event);
        account_isoch(data, event);
    }

    fn name(&self) -> &'static str {
        "udp-isochronous"
    }
}

fn account_transfer(data: &mut ReporterData, event: &PacketEvent) {
    if event.socket != 0 {
        data.socket = event.socket;
    }
    data.bytes.current += event.packet_len;
    data.packets.current += 1;
}

fn account_socket_call(data: &mut ReporterData, event: &PacketEvent) {
    match &mut data.sock_calls {
        SockCallStats::Read(read) => read.update(event.packet_len),
        SockCallStats::Write(write) => write.update(WriteOutcome::from(event)),
    }
}

fn account_ipg(data: &mut ReporterData, event: &PacketEvent) {
    if data.last_packet_time.is_set() {
        data.ipg_count.current += 1;
        data.ipg_sum += event.packet_time.seconds_since(data.last_packet_time);
    }
    data.last_packet_time = event.packet_time;
}

/// Latency, histogram and RFC 1889 jitter.
///
/// Jitter uses raw transit differences, so a constant clock offset between
/// sender and receiver cancels out even when the latency itself is rejected
/// as implausible.
fn account_transit(data: &mut ReporterData, event: &PacketEvent) {
    let Some(transit) = event.transit() else {
        return;
    };
    if data.transit.record(transit) {
        if let Some(histogram) = data.latency_histogram.as_mut() {
            histogram.add_seconds(transit);
        }
    }
    if let Some(previous) = data.last_transit {
        let delta = (transit - previous).abs();
        data.jitter += (delta - data.jitter) / JITTER_GAIN;
    }
    data.last_transit = Some(transit);
}

/// Sequence accounting for datagrams carrying a packet id.
///
/// A lower id than expected is a reordered (or duplicated) packet; a higher
/// one opens a gap counted as lost until reordered packets fill it. The
/// highest id seen never decreases.
fn account_sequence(data: &mut ReporterData, event: &PacketEvent) {
    let id = event.packet_id;
    if id <= 0 {
        return;
    }
    let expected = data.packet_id + 1;
    if id < expected {
        data.out_of_order.current += 1;
    } else {
        if id > expected {
            data.cnt_error.current += (id - expected) as u64;
        }
        data.packet_id = id;
    }
}

fn account_isoch(data: &mut ReporterData, event: &PacketEvent) {
    let (Some(isoch), Some(frame)) = (data.isoch.as_mut(), event.isoch) else {
        return;
    };
    let latency = isoch.record(IsochSample {
        frame,
        sent_time: Some(event.sent_time).filter(|t| t.is_set()),
        packet_time: event.packet_time,
    });
    if let Some(latency) = latency {
        if let Some(frames) = data.frame_transit.as_mut() {
            if frames.record(latency) {
                if let Some(histogram) = data.frame_histogram.as_mut() {
                    histogram.add_seconds(latency);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsochConfig;
    use crate::packet::{IsochFrame, L2Flags, TcpInfoSample, Timestamp, WriteErr};
    use std::time::Duration;

    fn ms(t: i64) -> Timestamp {
        Timestamp::from_nanos(1_700_000_000_000_000_000 + t * 1_000_000)
    }

    fn setup(settings: StreamSettings) -> (ReporterData, StreamHandler) {
        let handler = StreamHandler::for_settings(&settings);
        let mut data = ReporterData::new(1, None, settings).unwrap();
        data.start(ms(0));
        (data, handler)
    }

    fn udp_server() -> StreamSettings {
        StreamSettings::new(Role::Server, Protocol::Udp)
    }

    fn datagram(id: i64, sent_ms: i64, transit_us: i64) -> PacketEvent {
        let sent = ms(sent_ms);
        PacketEvent::datagram(id, 1470, sent, sent + Duration::from_micros(transit_us as u64))
    }

    #[test]
    fn test_factory_selects_handler() {
        assert_eq!(StreamHandler::for_settings(&udp_server()).name(), "udp");
        assert_eq!(
            StreamHandler::for_settings(&StreamSettings::new(Role::Client, Protocol::Tcp)).name(),
            "tcp"
        );
        let isoch = udp_server().with_isoch(Some(IsochConfig::default()));
        assert_eq!(StreamHandler::for_settings(&isoch).name(), "udp-isochronous");
    }

    #[test]
    fn test_udp_sequence_accounting() {
        let (mut data, mut handler) = setup(udp_server());
        for id in [1, 2, 5, 3, 6, 6] {
            handler.handle(&mut data, &datagram(id, id, 500));
        }
        // 5 opens a gap of two (3, 4); 3 arrives late; 6 is seen twice.
        assert_eq!(data.cnt_error.current, 2);
        assert_eq!(data.out_of_order.current, 2);
        assert_eq!(data.packet_id, 6);
        assert_eq!(data.datagrams.current, 6);
        assert_eq!(data.bytes.current, 6 * 1470);
    }

    #[test]
    fn test_jitter_follows_rfc1889() {
        let (mut data, mut handler) = setup(udp_server());
        handler.handle(&mut data, &datagram(1, 0, 1000));
        assert_eq!(data.jitter, 0.0);
        handler.handle(&mut data, &datagram(2, 10, 2600));
        assert!((data.jitter - 0.0016 / 16.0).abs() < 1e-12);

        // Constant transit keeps decaying the estimate.
        let before = data.jitter;
        handler.handle(&mut data, &datagram(3, 20, 2600));
        assert!(data.jitter < before);
    }

    #[test]
    fn test_clock_skew_is_counted_not_averaged() {
        let (mut data, mut handler) = setup(udp_server());
        for id in 1..=10 {
            let sent = ms(id);
            let received = Timestamp::from_nanos(sent.as_nanos() - 5_000_000_000);
            handler.handle(&mut data, &PacketEvent::datagram(id, 1470, sent, received));
        }
        let total = data.transit.total();
        assert_eq!(total.count, 0);
        assert_eq!(total.implausible, 10);
        assert!(total.unreliable);
        assert_eq!(data.jitter, 0.0);
        assert_eq!(data.datagrams.current, 10);
    }

    #[test]
    fn test_ipg_and_l2() {
        let (mut data, mut handler) = setup(udp_server().with_l2_checks(true));
        handler.handle(&mut data, &datagram(1, 0, 100));
        handler.handle(
            &mut data,
            &datagram(2, 4, 100).with_l2(L2Flags::CHECKSUM_ERROR, 1512, 1512),
        );
        handler.handle(&mut data, &datagram(3, 10, 100));

        assert_eq!(data.ipg_count.current, 2);
        assert!((data.ipg_sum - 0.010).abs() < 1e-9);
        let l2 = data.l2.as_ref().unwrap().total();
        assert_eq!(l2.total, 3);
        assert_eq!(l2.checksum_errors, 1);
    }

    #[test]
    fn test_tcp_client_write_accounting() {
        let (mut data, mut handler) = setup(StreamSettings::new(Role::Client, Protocol::Tcp));
        let info = TcpInfoSample {
            retransmits: 3,
            cwnd: 64_000,
            rtt_us: 250,
        };
        handler.handle(&mut data, &PacketEvent::transfer(0, 131_072, ms(1)).with_tcp_info(info));
        handler.handle(
            &mut data,
            &PacketEvent::transfer(0, 0, ms(2)).with_write_err(WriteErr::Account),
        );

        let writes = match &data.sock_calls {
            SockCallStats::Write(w) => w.total(),
            SockCallStats::Read(_) => panic!("client must count writes"),
        };
        assert_eq!(writes.writes, 2);
        assert_eq!(writes.errors, 1);
        assert_eq!(writes.retries, 3);
        assert_eq!(writes.cwnd, 64_000);
        assert_eq!(data.transit.total().samples(), 0);
    }

    #[test]
    fn test_isoch_frame_latency_reaches_histogram() {
        let settings = udp_server()
            .with_isoch(Some(IsochConfig::default()))
            .with_histogram(Some(Default::default()));
        let (mut data, mut handler) = setup(settings);

        let frame = |remaining| IsochFrame {
            frame_id: 1,
            prev_frame_id: 0,
            remaining,
            ..Default::default()
        };
        handler.handle(&mut data, &datagram(1, 0, 1000).with_isoch(frame(1470)));
        handler.handle(&mut data, &datagram(2, 1, 2000).with_isoch(frame(0)));

        let frames = data.frame_transit.as_ref().unwrap().total();
        assert_eq!(frames.count, 1);
        // First packet sent at 0 ms, last received at 3 ms.
        assert!((frames.mean - 0.003).abs() < 1e-9);
        assert_eq!(data.frame_histogram.as_ref().unwrap().total_snapshot().samples, 1);
        assert_eq!(data.isoch.as_ref().unwrap().total().frames, 1);
    }
}

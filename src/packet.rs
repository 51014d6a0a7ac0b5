//! # Packet Events
//!
//! A [`PacketEvent`] is the record a traffic thread produces for every unit of
//! I/O it performs. Events are plain `Copy` values: they are copied into a
//! ring slot on enqueue and copied out again on dequeue, so the producer and
//! the reporter never share a reference to the same event.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::time::Duration;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Wall-clock instant as signed nanoseconds since the Unix epoch.
///
/// Sender and receiver clocks are independent, so differences between two
/// timestamps can legitimately be negative. `Timestamp::ZERO` means "not set".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Current system time.
    pub fn now() -> Self {
        Timestamp(crate::utils::current_timestamp_ns() as i64)
    }

    pub const fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * NANOS_PER_SEC).round() as i64)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / NANOS_PER_SEC
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as i64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_nanos() as i64))
    }
}

/// Outcome classification of a write call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteErr {
    /// The write succeeded.
    #[default]
    None,
    /// The write failed (or was retried) and counts as an attempted write.
    Account,
    /// The write failed fatally; counted as an error but not as a write.
    Fatal,
    /// The write failed in a way that should not be accounted at all.
    NoAccount,
}

/// Link-layer validation outcome bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L2Flags(u8);

impl L2Flags {
    pub const NONE: L2Flags = L2Flags(0);
    pub const UNKNOWN: L2Flags = L2Flags(0x01);
    pub const LENGTH_ERROR: L2Flags = L2Flags(0x02);
    pub const CHECKSUM_ERROR: L2Flags = L2Flags(0x04);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: L2Flags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn union(self, other: L2Flags) -> L2Flags {
        L2Flags(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for L2Flags {
    type Output = L2Flags;

    fn bitor(self, rhs: L2Flags) -> L2Flags {
        self.union(rhs)
    }
}

/// Isochronous framing carried by packets of a burst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IsochFrame {
    pub frame_id: i64,
    pub prev_frame_id: i64,
    pub burst_size: i64,
    pub burst_period: i64,
    /// Epoch of the isochronous schedule (time of frame 1).
    pub start_time: Timestamp,
    /// Bytes of the burst still to be sent after this packet.
    pub remaining: i64,
}

/// Kernel TCP state sampled by the socket layer alongside a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpInfoSample {
    /// Cumulative retransmits since the connection opened.
    pub retransmits: u64,
    /// Congestion window in bytes.
    pub cwnd: u32,
    /// Smoothed round-trip time in microseconds.
    pub rtt_us: u32,
}

/// One per-I/O record, authored by a traffic thread and read once by the
/// reporter thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketEvent {
    /// Datagram sequence id. Zero when the transport has no sequence numbers.
    pub packet_id: i64,
    pub packet_len: u64,
    /// Time the receiver observed the packet (or the writer finished the call).
    pub packet_time: Timestamp,
    /// Time the sender stamped into the packet.
    pub sent_time: Timestamp,
    pub write_err: WriteErr,
    /// No data was transferred; the event only advances the stream clock.
    pub empty_report: bool,
    pub socket: i32,
    pub l2_errors: L2Flags,
    pub l2_len: u32,
    pub expected_l2_len: u32,
    pub isoch: Option<IsochFrame>,
    pub tcp_info: Option<TcpInfoSample>,
}

impl PacketEvent {
    /// An event describing `len` bytes transferred at `packet_time`.
    pub fn transfer(packet_id: i64, len: u64, packet_time: Timestamp) -> Self {
        Self {
            packet_id,
            packet_len: len,
            packet_time,
            ..Default::default()
        }
    }

    /// A received datagram carrying the sender's timestamp.
    pub fn datagram(packet_id: i64, len: u64, sent_time: Timestamp, packet_time: Timestamp) -> Self {
        Self {
            packet_id,
            packet_len: len,
            packet_time,
            sent_time,
            ..Default::default()
        }
    }

    /// A no-data event used by idle producers to advance the report clock.
    pub fn empty(packet_time: Timestamp) -> Self {
        Self {
            packet_time,
            empty_report: true,
            ..Default::default()
        }
    }

    pub fn with_socket(mut self, socket: i32) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_write_err(mut self, write_err: WriteErr) -> Self {
        self.write_err = write_err;
        self
    }

    pub fn with_l2(mut self, flags: L2Flags, l2_len: u32, expected_l2_len: u32) -> Self {
        self.l2_errors = flags;
        self.l2_len = l2_len;
        self.expected_l2_len = expected_l2_len;
        self
    }

    pub fn with_isoch(mut self, frame: IsochFrame) -> Self {
        self.isoch = Some(frame);
        self
    }

    pub fn with_tcp_info(mut self, info: TcpInfoSample) -> Self {
        self.tcp_info = Some(info);
        self
    }

    /// One-way transit time in seconds, if the sender stamped the packet.
    pub fn transit(&self) -> Option<f64> {
        if self.sent_time.is_set() && self.packet_time.is_set() {
            Some(self.packet_time.seconds_since(self.sent_time))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let t0 = Timestamp::from_secs_f64(100.0);
        let t1 = t0 + Duration::from_millis(1500);
        assert!((t1.seconds_since(t0) - 1.5).abs() < 1e-12);
        assert!((t0.seconds_since(t1) + 1.5).abs() < 1e-12);
        assert_eq!(t1 - Duration::from_millis(1500), t0);
        assert!(!Timestamp::ZERO.is_set());
    }

    #[test]
    fn test_transit_requires_both_timestamps() {
        let now = Timestamp::from_secs_f64(10.0);
        assert_eq!(PacketEvent::transfer(1, 100, now).transit(), None);

        let sent = Timestamp::from_secs_f64(9.75);
        let transit = PacketEvent::datagram(1, 100, sent, now).transit().unwrap();
        assert!((transit - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_l2_flags() {
        let flags = L2Flags::UNKNOWN | L2Flags::CHECKSUM_ERROR;
        assert!(flags.contains(L2Flags::UNKNOWN));
        assert!(flags.contains(L2Flags::CHECKSUM_ERROR));
        assert!(!flags.contains(L2Flags::LENGTH_ERROR));
        assert!(!flags.contains(L2Flags::NONE));
        assert!(L2Flags::NONE.is_empty());
    }
}

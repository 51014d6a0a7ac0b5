//! Isochronous frame accounting.
//!
//! Isochronous traffic is sent as one burst ("frame") per `1 / fps` seconds.
//! Every packet carries the frame id it belongs to and the id of the frame
//! the sender produced before it, which lets the receiver tell frames lost in
//! the network apart from frames the sender never produced because it fell
//! behind schedule (a "slip").

use super::IntervalAccumulator;
use crate::config::IsochConfig;
use crate::packet::{IsochFrame, Timestamp};
use serde::{Deserialize, Serialize};

/// Which side of the stream is doing the accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameAccounting {
    /// Receiving side: a gap not explained by the sender's previous frame id
    /// is a lost frame.
    Receiver,
    /// Sending side: every gap in the frame sequence is a slip.
    Sender,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsochSample {
    pub frame: IsochFrame,
    /// Sender timestamp, when the packet carries one.
    pub sent_time: Option<Timestamp>,
    pub packet_time: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IsochSnapshot {
    pub fps: u32,
    /// Configured mean frame load, bits per second.
    pub mean: f64,
    pub variance: f64,
    pub jitter_buffer_frames: u32,
    /// Seconds between frame starts.
    pub burst_interval: f64,
    /// Seconds between packets inside a burst.
    pub burst_ipg: f64,
    pub frames: u64,
    pub frames_lost: u64,
    pub slips: u64,
    pub frame_id: i64,
}

impl IsochSnapshot {
    pub fn combine(&self, other: &IsochSnapshot) -> IsochSnapshot {
        IsochSnapshot {
            frames: self.frames + other.frames,
            frames_lost: self.frames_lost + other.frames_lost,
            slips: self.slips + other.slips,
            frame_id: self.frame_id.max(other.frame_id),
            ..*self
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameCounts {
    frames: u64,
    lost: u64,
    slips: u64,
}

impl FrameCounts {
    fn add(&mut self, other: &FrameCounts) {
        self.frames += other.frames;
        self.lost += other.lost;
        self.slips += other.slips;
    }
}

#[derive(Debug, Clone)]
pub struct IsochStats {
    config: IsochConfig,
    accounting: FrameAccounting,
    interval: FrameCounts,
    total: FrameCounts,
    frame_id: i64,
    /// Start of the open frame; `None` once its latency has been taken.
    frame_start: Option<Timestamp>,
}

impl IsochStats {
    pub fn new(config: IsochConfig, accounting: FrameAccounting) -> Self {
        Self {
            config,
            accounting,
            interval: FrameCounts::default(),
            total: FrameCounts::default(),
            frame_id: 0,
            frame_start: None,
        }
    }

    pub fn frame_id(&self) -> i64 {
        self.frame_id
    }

    /// Account one packet; returns the frame latency in seconds when the
    /// packet completes its frame.
    pub fn record(&mut self, sample: IsochSample) -> Option<f64> {
        let frame = sample.frame;

        if frame.frame_id != self.frame_id {
            self.interval.frames += 1;
            if self.frame_id != 0 {
                let delta = frame.frame_id - self.frame_id;
                if delta > 1 {
                    match self.accounting {
                        FrameAccounting::Receiver => {
                            let skipped_by_sender = frame.frame_id - frame.prev_frame_id;
                            self.interval.lost += (delta - skipped_by_sender).max(0) as u64;
                        }
                        FrameAccounting::Sender => {
                            self.interval.lost += (delta - 1) as u64;
                            self.interval.slips += 1;
                        }
                    }
                }
            }
            self.frame_id = frame.frame_id;
            self.frame_start = Some(sample.sent_time.unwrap_or(sample.packet_time));
        }

        if frame.remaining == 0 {
            return self
                .frame_start
                .take()
                .map(|start| sample.packet_time.seconds_since(start));
        }
        None
    }

    fn snapshot(&self, counts: &FrameCounts) -> IsochSnapshot {
        IsochSnapshot {
            fps: self.config.fps,
            mean: self.config.mean,
            variance: self.config.variance,
            jitter_buffer_frames: self.config.jitter_buffer_frames,
            burst_interval: self.config.burst_interval(),
            burst_ipg: self.config.burst_ipg,
            frames: counts.frames,
            frames_lost: counts.lost,
            slips: counts.slips,
            frame_id: self.frame_id,
        }
    }
}

impl IntervalAccumulator for IsochStats {
    type Sample = IsochSample;
    type Snapshot = IsochSnapshot;

    fn update(&mut self, sample: IsochSample) {
        let _ = self.record(sample);
    }

    fn interval(&self) -> IsochSnapshot {
        self.snapshot(&self.interval)
    }

    fn total(&self) -> IsochSnapshot {
        let mut counts = self.total;
        counts.add(&self.interval);
        self.snapshot(&counts)
    }

    fn merge_into_total(&mut self) {
        let interval = self.interval;
        self.total.add(&interval);
    }

    fn reset_interval(&mut self) {
        self.interval = FrameCounts::default();
    }
}

//! # Stream Settings
//!
//! [`StreamSettings`] is the immutable configuration value handed to every
//! stream at registration. Variants of a test (client vs. server side, a
//! reverse test, a stream with its own histogram) are derived from a base
//! value with the `with_*` copy-with-override methods instead of being
//! mutated in place.
//!
//! The defaults come from [`crate::defaults`].

use crate::defaults;
use crate::error::{ReportError, Result};
use crate::histogram::HistogramConfig;
use crate::stats::LatencyWindow;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which end of the traffic a stream measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum Role {
    /// Traffic generator; accounts writes.
    #[clap(name = "client")]
    Client,

    /// Traffic receiver; accounts reads, loss and latency.
    #[clap(name = "server")]
    Server,
}

impl Role {
    pub fn reversed(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "Client"),
            Role::Server => write!(f, "Server"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum Protocol {
    #[clap(name = "tcp")]
    Tcp,

    #[clap(name = "udp")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// What a producer does when its ring is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueuePolicy {
    /// Wait for the reporter to drain a slot. No event is ever lost.
    #[default]
    Block,
    /// Retry with exponential backoff, then drop the event.
    Spin { attempts: u32 },
    /// Drop the event immediately.
    Drop,
}

impl fmt::Display for EnqueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueuePolicy::Block => write!(f, "block"),
            EnqueuePolicy::Spin { attempts } => write!(f, "spin:{}", attempts),
            EnqueuePolicy::Drop => write!(f, "drop"),
        }
    }
}

impl FromStr for EnqueuePolicy {
    type Err = String;

    /// Accepts `block`, `drop`, `spin` or `spin:<attempts>`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "block" => Ok(EnqueuePolicy::Block),
            "drop" => Ok(EnqueuePolicy::Drop),
            "spin" => Ok(EnqueuePolicy::Spin {
                attempts: defaults::SPIN_ATTEMPTS,
            }),
            other => {
                let attempts = other
                    .strip_prefix("spin:")
                    .ok_or_else(|| format!("Unknown enqueue policy: {}", other))?;
                let attempts: u32 = attempts
                    .parse()
                    .map_err(|_| format!("Invalid spin attempt count: {}", attempts))?;
                if attempts == 0 {
                    return Err("Spin attempt count must be at least 1".to_string());
                }
                Ok(EnqueuePolicy::Spin { attempts })
            }
        }
    }
}

/// Report categories to leave out of the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressFlags {
    pub settings: bool,
    pub connection: bool,
    pub data: bool,
    pub server: bool,
    pub sum: bool,
}

impl FromStr for SuppressFlags {
    type Err = String;

    /// One letter per category, case-insensitive: `S`ettings, `C`onnection,
    /// `D`ata, ser`V`er, `M`ulti-stream sums.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut flags = SuppressFlags::default();
        for c in s.chars() {
            match c.to_ascii_uppercase() {
                'S' => flags.settings = true,
                'C' => flags.connection = true,
                'D' => flags.data = true,
                'V' => flags.server = true,
                'M' => flags.sum = true,
                other => return Err(format!("Unknown report category: {}", other)),
            }
        }
        Ok(flags)
    }
}

/// Isochronous traffic shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IsochConfig {
    pub fps: u32,
    /// Mean frame load in bits per second.
    pub mean: f64,
    /// Variance of the log-normal frame load, bits per second.
    pub variance: f64,
    /// Seconds between packets of one burst.
    pub burst_ipg: f64,
    /// Receiver jitter buffer, in frames.
    pub jitter_buffer_frames: u32,
}

impl Default for IsochConfig {
    fn default() -> Self {
        Self {
            fps: defaults::ISOCH_FPS,
            mean: defaults::ISOCH_MEAN,
            variance: defaults::ISOCH_VARIANCE,
            burst_ipg: defaults::ISOCH_BURST_IPG,
            jitter_buffer_frames: 0,
        }
    }
}

impl IsochConfig {
    /// Seconds between the starts of two frames.
    pub fn burst_interval(&self) -> f64 {
        if self.fps == 0 {
            0.0
        } else {
            1.0 / self.fps as f64
        }
    }

    /// Mean bytes per frame implied by `mean` and `fps`.
    pub fn mean_frame_bytes(&self) -> f64 {
        if self.fps == 0 {
            0.0
        } else {
            self.mean / 8.0 / self.fps as f64
        }
    }
}

/// Per-stream configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub role: Role,
    pub protocol: Protocol,
    /// Bytes per read/write call.
    pub buffer_len: usize,
    /// Interval report period; `None` produces only final reports.
    pub interval: Option<Duration>,
    pub enhanced: bool,
    pub histogram: Option<HistogramConfig>,
    pub isoch: Option<IsochConfig>,
    pub suppress: SuppressFlags,
    pub l2_checks: bool,
    pub ring_capacity: usize,
    pub enqueue_policy: EnqueuePolicy,
    pub latency_window: LatencyWindow,
    /// Target UDP rate, bits per second.
    pub udp_rate: Option<f64>,
    pub mss: Option<u32>,
    pub window_size: Option<u32>,
    pub host: String,
    pub local_bind: Option<String>,
    pub interface: Option<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            role: Role::Client,
            protocol: Protocol::Tcp,
            buffer_len: defaults::TCP_BUFFER_LEN,
            interval: None,
            enhanced: false,
            histogram: None,
            isoch: None,
            suppress: SuppressFlags::default(),
            l2_checks: false,
            ring_capacity: defaults::RING_CAPACITY,
            enqueue_policy: EnqueuePolicy::Block,
            latency_window: LatencyWindow::default(),
            udp_rate: None,
            mss: None,
            window_size: None,
            host: defaults::HOST.to_string(),
            local_bind: None,
            interface: None,
        }
    }
}

impl StreamSettings {
    pub fn new(role: Role, protocol: Protocol) -> Self {
        Self::default().with_role(role).with_protocol(protocol)
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Switching protocol also switches the default buffer length.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        if self.buffer_len == defaults::TCP_BUFFER_LEN || self.buffer_len == defaults::UDP_BUFFER_LEN {
            self.buffer_len = match protocol {
                Protocol::Tcp => defaults::TCP_BUFFER_LEN,
                Protocol::Udp => defaults::UDP_BUFFER_LEN,
            };
        }
        self.protocol = protocol;
        self
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    /// Set the report interval.
    ///
    /// Intervals shorter than [`defaults::SMALLEST_INTERVAL`] are raised to it,
    /// and intervals under [`defaults::ENHANCED_INTERVAL_THRESHOLD`] turn on
    /// enhanced reporting.
    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval.map(|i| i.max(defaults::SMALLEST_INTERVAL));
        if let Some(i) = self.interval {
            if i < defaults::ENHANCED_INTERVAL_THRESHOLD {
                self.enhanced = true;
            }
        }
        self
    }

    pub fn with_enhanced(mut self, enhanced: bool) -> Self {
        self.enhanced = enhanced;
        self
    }

    pub fn with_histogram(mut self, histogram: Option<HistogramConfig>) -> Self {
        self.histogram = histogram;
        self
    }

    pub fn with_isoch(mut self, isoch: Option<IsochConfig>) -> Self {
        self.isoch = isoch;
        self
    }

    pub fn with_suppress(mut self, suppress: SuppressFlags) -> Self {
        self.suppress = suppress;
        self
    }

    pub fn with_l2_checks(mut self, l2_checks: bool) -> Self {
        self.l2_checks = l2_checks;
        self
    }

    pub fn with_ring_capacity(mut self, ring_capacity: usize) -> Self {
        self.ring_capacity = ring_capacity;
        self
    }

    pub fn with_enqueue_policy(mut self, policy: EnqueuePolicy) -> Self {
        self.enqueue_policy = policy;
        self
    }

    pub fn with_latency_window(mut self, window: LatencyWindow) -> Self {
        self.latency_window = window;
        self
    }

    pub fn with_udp_rate(mut self, bits_per_second: Option<f64>) -> Self {
        self.udp_rate = bits_per_second;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_local_bind(mut self, local_bind: Option<String>) -> Self {
        self.local_bind = local_bind;
        self
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_tcp_params(mut self, mss: Option<u32>, window_size: Option<u32>) -> Self {
        self.mss = mss;
        self.window_size = window_size;
        self
    }

    /// Settings for the opposite end of the same test.
    pub fn reversed(&self) -> Self {
        self.clone().with_role(self.role.reversed())
    }

    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    pub fn is_isochronous(&self) -> bool {
        self.isoch.is_some()
    }

    /// Check everything a stream needs before its report state is built.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity == 0 {
            return Err(ReportError::InvalidRingCapacity(self.ring_capacity));
        }
        if let Some(interval) = self.interval {
            if interval < defaults::SMALLEST_INTERVAL {
                return Err(ReportError::Config(format!(
                    "report interval {:?} is below the smallest interval {:?}",
                    interval,
                    defaults::SMALLEST_INTERVAL
                )));
            }
        }
        if self.buffer_len == 0 {
            return Err(ReportError::Config("buffer length must be at least 1".into()));
        }
        if let Some(histogram) = &self.histogram {
            histogram.validate()?;
        }
        if self.latency_window.min > self.latency_window.max {
            return Err(ReportError::Config(format!(
                "latency window lower bound {} exceeds upper bound {}",
                self.latency_window.min, self.latency_window.max
            )));
        }
        if let Some(isoch) = &self.isoch {
            if isoch.fps == 0 {
                return Err(ReportError::Config("isochronous fps must be at least 1".into()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "-".repeat(60))?;
        match self.role {
            Role::Client => writeln!(f, "Client connecting to {}, {}", self.host, self.protocol)?,
            Role::Server => writeln!(f, "Server listening, {}", self.protocol)?,
        }
        match self.protocol {
            Protocol::Udp => writeln!(f, "Sending/receiving {} byte datagrams", self.buffer_len)?,
            Protocol::Tcp => writeln!(f, "Read/write buffer length {} bytes", self.buffer_len)?,
        }
        if let Some(rate) = self.udp_rate {
            writeln!(f, "Target rate {}", crate::utils::format_bits_rate(rate))?;
        }
        if let Some(isoch) = &self.isoch {
            writeln!(
                f,
                "Isochronous {} fps, mean {}, variance {}, ipg {:.3} ms",
                isoch.fps,
                crate::utils::format_bits_rate(isoch.mean),
                crate::utils::format_bits_rate(isoch.variance),
                isoch.burst_ipg * 1e3
            )?;
        }
        if let Some(histogram) = &self.histogram {
            writeln!(
                f,
                "Latency histogram {} bins of {}{}, CI {}/{}",
                histogram.bin_count,
                histogram.bin_width,
                histogram.units,
                histogram.lower_ci_pct,
                histogram.upper_ci_pct
            )?;
        }
        write!(f, "{}", "-".repeat(60))
    }
}

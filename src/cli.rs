use crate::config::{EnqueuePolicy, IsochConfig, Protocol, Role, StreamSettings, SuppressFlags};
use crate::histogram::{HistogramConfig, HistogramUnits};
use crate::simulate::SimulationConfig;
use crate::stats::LatencyWindow;
use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use std::time::Duration;

/// netmeter - network throughput and latency measurement with interval reports
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
#[clap(group(ArgGroup::new("mode").required(true).args(["server", "client"])))]
pub struct Args {
    /// Run as the receiving end
    #[clap(short = 's', long, help_heading = "Core Options")]
    pub server: bool,

    /// Run as the sending end, connecting to <HOST>
    #[clap(short = 'c', long, value_name = "HOST", help_heading = "Core Options")]
    pub client: Option<String>,

    /// Use UDP rather than TCP
    #[clap(short = 'u', long, help_heading = "Core Options")]
    pub udp: bool,

    /// Read/write length in bytes (K/M suffixes; 128K for TCP, 1470 for UDP)
    #[clap(short = 'l', long, value_parser = parse_size, help_heading = "Core Options")]
    pub len: Option<u64>,

    /// Seconds between periodic reports (fractions allowed, e.g. 0.5)
    #[clap(short = 'i', long, value_parser = parse_duration, help_heading = "Core Options")]
    pub interval: Option<Duration>,

    /// Test duration
    #[clap(short = 't', long, value_parser = parse_duration, default_value = "10", help_heading = "Core Options")]
    pub time: Duration,

    /// Number of parallel streams
    #[clap(short = 'P', long, default_value_t = 1, help_heading = "Core Options")]
    pub parallel: usize,

    /// UDP target rate in bits/sec (k/m/g = bits, K/M/G = bytes)
    #[clap(short = 'b', long, value_parser = parse_rate, help_heading = "Core Options")]
    pub bandwidth: Option<f64>,

    /// Enhanced reports: latency, packet rate and socket call detail
    #[clap(short = 'e', long, help_heading = "Reporting")]
    pub enhanced: bool,

    /// Latency histogram: <binwidth>[u],<bins>,<ci_lower>,<ci_upper>
    #[clap(
        long,
        value_name = "SPEC",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "",
        value_parser = parse_histogram_spec,
        help_heading = "Reporting"
    )]
    pub histograms: Option<HistogramConfig>,

    /// Isochronous traffic: <fps>:<mean>,<variance>
    #[clap(
        long,
        value_name = "SPEC",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "",
        value_parser = parse_isoch_spec,
        help_heading = "Reporting"
    )]
    pub isochronous: Option<IsochConfig>,

    /// Gap between packets of one isochronous burst, in milliseconds
    #[clap(long, value_name = "MS", help_heading = "Reporting")]
    pub ipg: Option<f64>,

    /// Report categories to leave out: S(ettings) C(onnection) D(ata) V (server) M (multi-stream sums)
    #[clap(short = 'x', long = "reportexclude", value_name = "CDMSV", help_heading = "Reporting")]
    pub report_exclude: Option<SuppressFlags>,

    /// Count link-layer length and checksum errors (UDP)
    #[clap(long = "l2checks", help_heading = "Reporting")]
    pub l2_checks: bool,

    /// Accepted one-way latency range in seconds: <min>,<max>
    #[clap(long, value_parser = parse_latency_window, allow_hyphen_values = true, help_heading = "Reporting")]
    pub latency_window: Option<LatencyWindow>,

    /// Slots per packet ring
    #[clap(long, default_value_t = crate::defaults::RING_CAPACITY, help_heading = "Reporter")]
    pub ring_capacity: usize,

    /// Behaviour on a full ring: block, drop, spin or spin:<attempts>
    #[clap(long, default_value = "block", help_heading = "Reporter")]
    pub enqueue_policy: EnqueuePolicy,

    /// Write reports as JSON lines to this file instead of text to stdout
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Verbose logging
    #[clap(short = 'v', long, help_heading = "Output")]
    pub verbose: bool,

    /// Local address shown in connection reports
    #[clap(short = 'B', long, value_name = "HOST", help_heading = "Connection")]
    pub bind: Option<String>,

    /// Network interface shown in connection reports
    #[clap(long, help_heading = "Connection")]
    pub interface: Option<String>,

    /// TCP maximum segment size
    #[clap(short = 'M', long, help_heading = "Connection")]
    pub mss: Option<u32>,

    /// Socket window size (K/M suffixes)
    #[clap(short = 'w', long, value_parser = parse_size, help_heading = "Connection")]
    pub window: Option<u64>,

    /// Mean one-way latency of the synthetic path, in milliseconds
    #[clap(long, default_value_t = 0.5, help_heading = "Simulation")]
    pub sim_latency: f64,

    /// Receiver clock offset in seconds (negative values model a receiver behind the sender)
    #[clap(long, default_value_t = 0.0, allow_hyphen_values = true, help_heading = "Simulation")]
    pub skew: f64,

    /// Percentage of datagrams to lose
    #[clap(long, default_value_t = 0.0, help_heading = "Simulation")]
    pub loss: f64,

    /// Percentage of datagrams to deliver out of order
    #[clap(long, default_value_t = 0.0, help_heading = "Simulation")]
    pub reorder: f64,

    /// Seed for the synthetic traffic generator
    #[clap(long, help_heading = "Simulation")]
    pub seed: Option<u64>,
}

impl Args {
    pub fn role(&self) -> Role {
        if self.server {
            Role::Server
        } else {
            Role::Client
        }
    }

    pub fn protocol(&self) -> Protocol {
        if self.udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Parameters of the synthetic traffic standing in for sockets.
    pub fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            duration: self.time,
            mean_latency: self.sim_latency / 1e3,
            clock_skew: self.skew,
            loss_pct: self.loss,
            reorder_pct: self.reorder,
            seed: self.seed,
        }
    }
}

impl From<&Args> for StreamSettings {
    fn from(args: &Args) -> Self {
        let protocol = args.protocol();
        let mut settings = StreamSettings::new(args.role(), protocol)
            .with_enhanced(args.enhanced)
            .with_interval(args.interval.filter(|i| !i.is_zero()))
            .with_histogram(args.histograms)
            .with_suppress(args.report_exclude.unwrap_or_default())
            .with_l2_checks(args.l2_checks && protocol == Protocol::Udp)
            .with_ring_capacity(args.ring_capacity)
            .with_enqueue_policy(args.enqueue_policy)
            .with_latency_window(args.latency_window.unwrap_or_default())
            .with_local_bind(args.bind.clone())
            .with_interface(args.interface.clone())
            .with_tcp_params(args.mss, args.window.map(|w| w as u32));

        if let Some(len) = args.len {
            settings = settings.with_buffer_len(len as usize);
        }
        if let Some(host) = &args.client {
            settings = settings.with_host(host.clone());
        }
        if protocol == Protocol::Udp {
            settings = settings.with_udp_rate(Some(args.bandwidth.unwrap_or(crate::defaults::UDP_RATE)));
        }
        if let Some(mut isoch) = args.isochronous {
            if let Some(ipg) = args.ipg {
                isoch.burst_ipg = ipg / 1e3;
            }
            settings = settings.with_isoch(Some(isoch));
        }
        settings
    }
}

/// Parse duration from string (e.g., "10s", "0.5", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1e3,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_secs_f64(seconds))
}

/// Split a trailing unit letter off a number.
fn split_suffix(s: &str) -> (&str, Option<char>) {
    match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], Some(c)),
        _ => (s, None),
    }
}

fn parse_number(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", s))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Value must be a non-negative number: {}", s));
    }
    Ok(value)
}

/// Parse a rate in bits per second.
///
/// Lowercase suffixes are decimal bit multiples (`10m` = 10,000,000 bits/sec);
/// uppercase suffixes are binary byte multiples (`1M` = 1,048,576 bytes/sec).
pub fn parse_rate(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (num, suffix) = split_suffix(s);
    let value = parse_number(num)?;
    let scale = match suffix {
        None => 1.0,
        Some('k') => 1e3,
        Some('m') => 1e6,
        Some('g') => 1e9,
        Some('K') => 8.0 * 1024.0,
        Some('M') => 8.0 * 1024.0 * 1024.0,
        Some('G') => 8.0 * 1024.0 * 1024.0 * 1024.0,
        Some(other) => return Err(format!("Unknown rate suffix: {}", other)),
    };
    Ok(value * scale)
}

/// Parse a byte count with an optional K/M/G suffix (binary multiples).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (num, suffix) = split_suffix(s);
    let value = parse_number(num)?;
    let scale = match suffix.map(|c| c.to_ascii_uppercase()) {
        None => 1.0,
        Some('K') => 1024.0,
        Some('M') => 1024.0 * 1024.0,
        Some('G') => 1024.0 * 1024.0 * 1024.0,
        Some(other) => return Err(format!("Unknown size suffix: {}", other)),
    };
    Ok((value * scale) as u64)
}

/// Parse `<binwidth>[u],<bins>,<ci_lower>,<ci_upper>`.
///
/// Every field is optional from the right; an empty string yields the
/// default histogram. A `u` after the bin width switches the bins to
/// microseconds.
pub fn parse_histogram_spec(s: &str) -> Result<HistogramConfig, String> {
    let mut config = HistogramConfig::default();
    let mut fields = s.split(',').map(str::trim);

    if let Some(width) = fields.next().filter(|f| !f.is_empty()) {
        let width = match width.strip_suffix('u') {
            Some(stripped) => {
                config.units = HistogramUnits::Microseconds;
                stripped
            }
            None => width,
        };
        config.bin_width = parse_number(width)?;
    }
    if let Some(bins) = fields.next().filter(|f| !f.is_empty()) {
        config.bin_count = parse_size(bins)? as usize;
    }
    if let Some(lower) = fields.next().filter(|f| !f.is_empty()) {
        config.lower_ci_pct = parse_number(lower)?;
    }
    if let Some(upper) = fields.next().filter(|f| !f.is_empty()) {
        config.upper_ci_pct = parse_number(upper)?;
    }
    if fields.next().is_some() {
        return Err(format!("Too many histogram fields: {}", s));
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Parse `<fps>:<mean>,<variance>`, with mean and variance as rates.
///
/// Missing parts keep their defaults (60 fps, 20 Mbit/s, zero variance).
pub fn parse_isoch_spec(s: &str) -> Result<IsochConfig, String> {
    let mut config = IsochConfig::default();
    let s = s.trim();
    if s.is_empty() {
        return Ok(config);
    }

    let (fps, load) = match s.split_once(':') {
        Some((fps, load)) => (Some(fps), load),
        None if s.contains(',') => (None, s),
        None => (Some(s), ""),
    };
    if let Some(fps) = fps.map(str::trim).filter(|f| !f.is_empty()) {
        config.fps = fps
            .parse()
            .map_err(|_| format!("Invalid frames per second: {}", fps))?;
        if config.fps == 0 {
            return Err("Frames per second must be at least 1".to_string());
        }
    }

    let mut load = load.split(',').map(str::trim);
    if let Some(mean) = load.next().filter(|f| !f.is_empty()) {
        config.mean = parse_rate(mean)?;
    }
    if let Some(variance) = load.next().filter(|f| !f.is_empty()) {
        config.variance = parse_rate(variance)?;
    }
    Ok(config)
}

/// Parse `<min>,<max>` in seconds.
fn parse_latency_window(s: &str) -> Result<LatencyWindow, String> {
    let (min, max) = s
        .split_once(',')
        .ok_or_else(|| format!("Expected <min>,<max>: {}", s))?;
    let parse = |v: &str| -> Result<f64, String> {
        v.trim()
            .parse::<f64>()
            .map_err(|_| format!("Invalid number: {}", v))
    };
    let window = LatencyWindow {
        min: parse(min)?,
        max: parse(max)?,
    };
    if window.min > window.max {
        return Err(format!("Lower bound exceeds upper bound: {}", s));
    }
    Ok(window)
}

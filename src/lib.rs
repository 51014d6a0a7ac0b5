//! # netmeter
//!
//! Reporting and statistics engine for network throughput and latency
//! measurement.
//!
//! Traffic threads describe every unit of I/O they perform as a
//! [`PacketEvent`] and push it into a bounded single-producer/single-consumer
//! [`ring`]. One reporter thread drains all rings, updates numerically stable
//! online statistics and emits interval and final reports to a
//! [`ReportSink`]. Parallel streams of one test form a group whose members
//! start together behind a barrier and whose reports are summed.
//!
//! ## Architecture Overview
//!
//! - `packet`: the per-I/O event record and timestamps
//! - `ring`: the packet ring carrying events from a traffic thread to the
//!   reporter
//! - `histogram`: fixed-bin latency histograms with confidence intervals
//! - `stats`: interval/lifetime accumulators (latency, socket calls, L2,
//!   isochronous frames, HDR percentiles)
//! - `report`: per-stream report state, packet handlers, group headers and
//!   group sums
//! - `reporter`: the reporter thread, the test context and stream handles
//! - `output`: text, JSON and in-memory report sinks
//! - `simulate`: synthetic traffic sources standing in for sockets
//! - `cli`, `config`, `logging`, `utils`: the command-line front end and its
//!   support code
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use netmeter::{
//!     MemorySink, PacketEvent, Protocol, Reporter, Role, StreamSettings, TestContext, Timestamp,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> netmeter::Result<()> {
//!     let context = Arc::new(TestContext::new());
//!     let sink = MemorySink::new();
//!     let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone()))?;
//!
//!     let settings = StreamSettings::new(Role::Server, Protocol::Udp)
//!         .with_interval(Some(Duration::from_secs(1)));
//!     let mut stream = reporter.register_stream(settings, None)?;
//!
//!     let start = Timestamp::now();
//!     for id in 1..=1000 {
//!         let sent = start + Duration::from_millis(id as u64);
//!         let received = sent + Duration::from_micros(250);
//!         stream.report_packet(PacketEvent::datagram(id, 1470, sent, received));
//!     }
//!     stream.close();
//!
//!     reporter.shutdown();
//!     reporter.join()?;
//!     println!("{} reports", sink.transfers().len());
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// Argument parsing using clap, including the histogram, isochronous and
/// rate option syntaxes.
pub mod cli;

/// Immutable per-stream configuration with copy-with-override.
pub mod config;

pub mod error;

/// Fixed-bin latency histogram
pub mod histogram;

/// Console and file logging setup
pub mod logging;

/// Report sinks
///
/// Consumers of the plain-data snapshots produced by the reporter:
/// - human-readable interval lines
/// - JSON lines with a run header
/// - in-memory collection for embedding and tests
pub mod output;

pub mod packet;

/// Per-stream and per-group report state
///
/// Contains the report header the reporter thread iterates over, the packet
/// handlers that update statistics, and the group aggregation that produces
/// sum reports for parallel streams.
pub mod report;

/// The reporter thread
///
/// Owns the work list of active streams, drains their rings and emits
/// reports. Streams are registered through a channel hand-off and fed
/// through [`reporter::StreamReporter`] handles.
pub mod reporter;

pub mod ring;

/// Synthetic traffic sources
pub mod simulate;

/// Online statistics accumulators
///
/// Welford latency statistics, socket call counters, L2 validation counters,
/// isochronous frame accounting and HDR percentiles, all following one
/// interval/lifetime accumulator contract.
pub mod stats;

pub mod utils;

// Re-export key types for convenient library usage

pub use config::{EnqueuePolicy, IsochConfig, Protocol, Role, StreamSettings, SuppressFlags};
pub use error::{ReportError, Result};
pub use histogram::{Histogram, HistogramConfig, HistogramSnapshot, HistogramUnits};
pub use output::{JsonSink, MemorySink, ReportSink, TextSink};
pub use packet::{IsochFrame, L2Flags, PacketEvent, TcpInfoSample, Timestamp, WriteErr};
pub use report::{ConnectionInfo, ReportKind, ReportScope, TransferInfo};
pub use reporter::{Reporter, ReporterHandle, StreamReporter, TestContext};
pub use ring::{ConsumerWake, PacketConsumer, PacketProducer, PacketRing};
pub use stats::{IntervalAccumulator, LatencyWindow, TransitSnapshot, TransitStats};

/// The current version of netmeter
///
/// Populated from Cargo.toml and carried in the JSON run header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Slots per packet ring.
    ///
    /// Sized to absorb several intervals' worth of bursts from a fast sender
    /// without the producer ever blocking under normal load.
    pub const RING_CAPACITY: usize = 5000;

    /// Default spin attempts for the `spin` enqueue policy.
    pub const SPIN_ATTEMPTS: u32 = 64;

    /// Default TCP read/write length.
    pub const TCP_BUFFER_LEN: usize = 128 * 1024;

    /// Default UDP datagram payload, sized to fit a 1500 byte MTU.
    pub const UDP_BUFFER_LEN: usize = 1470;

    /// Default UDP target rate, 1 Mbit/s.
    pub const UDP_RATE: f64 = 1_000_000.0;

    pub const HOST: &str = "127.0.0.1";

    /// Default test duration
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Report intervals are never shorter than this.
    pub const SMALLEST_INTERVAL: Duration = Duration::from_millis(5);

    /// Intervals below this switch on enhanced reporting.
    pub const ENHANCED_INTERVAL_THRESHOLD: Duration = Duration::from_millis(500);

    /// Longest the reporter sleeps between passes when no ring signals it.
    pub const REPORTER_QUANTUM: Duration = Duration::from_millis(100);

    /// Reporter passes a stream may lag behind wall-clock before it is
    /// flagged as CPU bound.
    pub const DELAY_THRESHOLD: u32 = 20;

    /// Clock-sanity window lower bound, seconds.
    pub const LATENCY_WINDOW_MIN: f64 = -1.0;

    /// Clock-sanity window upper bound, seconds.
    pub const LATENCY_WINDOW_MAX: f64 = 60.0;

    /// Latency histogram bin width, in histogram units (1 ms).
    pub const HISTOGRAM_BIN_WIDTH: f64 = 1.0;

    pub const HISTOGRAM_BIN_COUNT: usize = 1000;

    pub const HISTOGRAM_LOWER_CI: f64 = 5.0;

    pub const HISTOGRAM_UPPER_CI: f64 = 95.0;

    /// Isochronous frames per second.
    pub const ISOCH_FPS: u32 = 60;

    /// Isochronous mean load, bits per second.
    pub const ISOCH_MEAN: f64 = 20_000_000.0;

    pub const ISOCH_VARIANCE: f64 = 0.0;

    /// Gap between packets of one burst, seconds.
    pub const ISOCH_BURST_IPG: f64 = 0.005;
}

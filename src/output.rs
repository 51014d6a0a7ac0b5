//! Report sinks.
//!
//! The reporter thread hands every settings banner, connection record and
//! transfer report to one [`ReportSink`]. Sinks only format; all statistics
//! are computed before a report reaches them.
//!
//! - [`TextSink`]: human-readable lines, one per report
//! - [`JsonSink`]: one JSON object per line, preceded by a run header with
//!   version and system information
//! - [`MemorySink`]: collects everything in memory for embedding and tests

use crate::config::StreamSettings;
use crate::report::{ConnectionInfo, ReportKind, ReportScope, TransferInfo};
use crate::utils::{format_bits_rate, format_bytes, format_latency_ms, format_packet_rate};
use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Consumer of reporter output.
///
/// Called only from the reporter thread. An error is logged by the reporter
/// and does not stop reporting.
pub trait ReportSink: Send {
    /// Settings banner, once per standalone stream or group.
    fn settings(&mut self, settings: &StreamSettings) -> Result<()>;

    fn connection(&mut self, info: &ConnectionInfo) -> Result<()>;

    fn transfer(&mut self, info: &TransferInfo) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
        }
    }
}

/// First record of every JSON report stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

impl RunHeader {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            system_info: SystemInfo::default(),
        }
    }
}

/// One line of JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonRecord {
    Run(RunHeader),
    Settings(Box<StreamSettings>),
    Connection(ConnectionInfo),
    Transfer(Box<TransferInfo>),
}

/// Human-readable report lines.
pub struct TextSink {
    out: Box<dyn Write + Send>,
    enhanced: bool,
    header_printed: bool,
}

impl TextSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            enhanced: false,
            header_printed: false,
        }
    }

    /// Also print latency, percentile and socket-call detail.
    pub fn with_enhanced(mut self, enhanced: bool) -> Self {
        self.enhanced = enhanced;
        self
    }

    fn label(info: &TransferInfo) -> String {
        match (info.scope, info.stream_id) {
            (ReportScope::Sum, _) => "[SUM]".to_string(),
            (ReportScope::Stream, Some(id)) => format!("[{:>3}]", id),
            (ReportScope::Stream, None) => "[  ?]".to_string(),
        }
    }

    fn column_header(info: &TransferInfo) -> &'static str {
        if info.datagrams > 0 || info.lost > 0 {
            "[ ID] Interval            Transfer     Bandwidth        Jitter   Lost/Total Datagrams"
        } else {
            "[ ID] Interval            Transfer     Bandwidth"
        }
    }

    /// Format one transfer report as a single line.
    pub fn format_transfer(info: &TransferInfo, enhanced: bool) -> String {
        let mut line = format!(
            "{} {:>6.2}-{:<6.2} sec  {:>11}  {:>15}",
            Self::label(info),
            info.start,
            info.end,
            format_bytes(info.bytes),
            format_bits_rate(info.bits_per_second()),
        );

        if info.datagrams > 0 || info.lost > 0 {
            line.push_str(&format!(
                "  {} ms  {}/{} ({:.2}%)",
                format_latency_ms(info.jitter),
                info.lost,
                info.expected_datagrams(),
                info.lost_percent(),
            ));
        }
        if info.out_of_order > 0 {
            line.push_str(&format!("  {} datagrams received out-of-order", info.out_of_order));
        }

        if enhanced {
            if info.packets > 0 {
                line.push_str(&format!("  {}", format_packet_rate(info.packets_per_second())));
            }
            if let Some(transit) = info.transit.filter(|t| t.samples() > 0) {
                line.push_str(&format!(
                    "  latency {}/{}/{}/{} ms",
                    format_latency_ms(transit.mean),
                    format_latency_ms(transit.min),
                    format_latency_ms(transit.max),
                    format_latency_ms(transit.stddev),
                ));
                if transit.unreliable {
                    line.push_str(&format!(" (clock skew? {} implausible)", transit.implausible));
                }
            }
            if let Some(write) = info.sock_calls.as_write() {
                line.push_str(&format!("  {}/{} writes/err", write.writes, write.errors));
                if write.up_to_date {
                    line.push_str(&format!(
                        "  {} retry  {}K cwnd  {} us rtt",
                        write.retries,
                        write.cwnd / 1024,
                        write.rtt_us
                    ));
                }
            }
            if let Some(read) = info.sock_calls.as_read() {
                let bins: Vec<String> = read.bins.iter().map(u64::to_string).collect();
                line.push_str(&format!("  {} reads  {}", read.reads, bins.join(":")));
            }
            if let Some(isoch) = info.isoch {
                line.push_str(&format!(
                    "  {} frames  {} lost  {} slips",
                    isoch.frames, isoch.frames_lost, isoch.slips
                ));
            }
            if let Some(l2) = info.l2.filter(|l2| l2.errors() > 0) {
                line.push_str(&format!("  L2 errors {}/{}", l2.errors(), l2.total));
            }
            if info.ipg_count > 0 {
                line.push_str(&format!("  ipg {} ms", format_latency_ms(info.mean_ipg())));
            }
            if info.dropped > 0 {
                line.push_str(&format!("  {} dropped", info.dropped));
            }
        }
        if info.cpu_bound {
            line.push_str(" (reporter CPU bound)");
        }
        line
    }

    fn write_histogram(&mut self, info: &TransferInfo) -> Result<()> {
        for histogram in [&info.latency_histogram, &info.frame_histogram]
            .into_iter()
            .flatten()
        {
            let bins: Vec<String> = histogram
                .populated_bins()
                .map(|(i, count)| format!("{}:{}", i, count))
                .collect();
            let ci = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v));
            writeln!(
                self.out,
                "{} {} bin(w={}{}):cnt({})={} ({:.2}/{:.2}%={}/{},Outliers={})",
                Self::label(info),
                histogram.name,
                histogram.bin_width,
                histogram.units,
                histogram.samples,
                bins.join(","),
                histogram.lower_ci_pct,
                histogram.upper_ci_pct,
                ci(histogram.lower_ci_value),
                ci(histogram.upper_ci_value),
                histogram.outliers(),
            )?;
        }
        Ok(())
    }
}

impl ReportSink for TextSink {
    fn settings(&mut self, settings: &StreamSettings) -> Result<()> {
        writeln!(self.out, "{}", settings)?;
        Ok(())
    }

    fn connection(&mut self, info: &ConnectionInfo) -> Result<()> {
        let local = info.local_bind.as_deref().unwrap_or("*");
        write!(
            self.out,
            "[{:>3}] {} {} {} connected with {}",
            info.stream_id, info.role, info.protocol, local, info.host
        )?;
        if let Some(mss) = info.mss {
            write!(self.out, " (MSS={})", mss)?;
        }
        if let Some(interface) = &info.interface {
            write!(self.out, " on {}", interface)?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    fn transfer(&mut self, info: &TransferInfo) -> Result<()> {
        if !self.header_printed {
            writeln!(self.out, "{}", Self::column_header(info))?;
            self.header_printed = true;
        }
        writeln!(self.out, "{}", Self::format_transfer(info, self.enhanced))?;

        if info.kind == ReportKind::Final && self.enhanced && !info.percentiles.is_empty() {
            let values: Vec<String> = info
                .percentiles
                .iter()
                .map(|p| format!("p{}={}us", p.percentile, p.value_us))
                .collect();
            writeln!(self.out, "{} latency {}", Self::label(info), values.join(" "))?;
        }
        self.write_histogram(info)
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// JSON lines, one record per report.
pub struct JsonSink {
    out: Box<dyn Write + Send>,
    records: usize,
}

impl JsonSink {
    /// Write the run header and return a sink appending to `out`.
    pub fn new(out: Box<dyn Write + Send>, run_id: &str) -> Result<Self> {
        let mut sink = Self { out, records: 0 };
        sink.write_record(&JsonRecord::Run(RunHeader::new(run_id)))?;
        Ok(sink)
    }

    /// Create (or truncate) `path` and write JSON lines to it.
    pub fn create<P: AsRef<Path>>(path: P, run_id: &str) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!("Writing JSON reports to: {:?}", path.as_ref());
        Self::new(Box::new(BufWriter::new(file)), run_id)
    }

    pub fn records(&self) -> usize {
        self.records
    }

    fn write_record(&mut self, record: &JsonRecord) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        writeln!(self.out)?;
        self.records += 1;
        Ok(())
    }
}

impl ReportSink for JsonSink {
    fn settings(&mut self, settings: &StreamSettings) -> Result<()> {
        self.write_record(&JsonRecord::Settings(Box::new(settings.clone())))
    }

    fn connection(&mut self, info: &ConnectionInfo) -> Result<()> {
        self.write_record(&JsonRecord::Connection(info.clone()))
    }

    fn transfer(&mut self, info: &TransferInfo) -> Result<()> {
        self.write_record(&JsonRecord::Transfer(Box::new(info.clone())))
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRecords {
    settings: Vec<StreamSettings>,
    connections: Vec<ConnectionInfo>,
    transfers: Vec<TransferInfo>,
    flushes: usize,
}

/// In-memory sink. Clones share the same storage, so one clone can be given
/// to the reporter while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<MemoryRecords>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings banners received, one per standalone stream or group.
    pub fn banners(&self) -> Vec<StreamSettings> {
        self.records.lock().settings.clone()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.records.lock().connections.clone()
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.records.lock().transfers.clone()
    }

    /// Transfers matching a scope and kind, in emission order.
    pub fn transfers_where(&self, scope: ReportScope, kind: ReportKind) -> Vec<TransferInfo> {
        self.records
            .lock()
            .transfers
            .iter()
            .filter(|t| t.scope == scope && t.kind == kind)
            .cloned()
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.records.lock().flushes
    }
}

impl ReportSink for MemorySink {
    fn settings(&mut self, settings: &StreamSettings) -> Result<()> {
        self.records.lock().settings.push(settings.clone());
        Ok(())
    }

    fn connection(&mut self, info: &ConnectionInfo) -> Result<()> {
        self.records.lock().connections.push(info.clone());
        Ok(())
    }

    fn transfer(&mut self, info: &TransferInfo) -> Result<()> {
        self.records.lock().transfers.push(info.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.records.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};
    use crate::report::tests::transfer;
    use std::io::{BufRead, BufReader};
    use tempfile::NamedTempFile;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();
        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
    }

    #[test]
    fn test_text_line_for_udp_interval() {
        let mut info = transfer(3, 0.0, 1.0, 1470 * 1000);
        info.lost = 10;
        info.datagrams = 990;
        info.jitter = 0.00125;

        let line = TextSink::format_transfer(&info, false);
        assert!(line.starts_with("[  3]"));
        assert!(line.contains("1.40 MBytes"));
        assert!(line.contains("11.8 Mbits/sec"));
        assert!(line.contains("1.250 ms"));
        assert!(line.contains("10/1000 (1.00%)"));
    }

    #[test]
    fn test_text_sink_writes_header_once() {
        let buffer = SharedBuffer::default();
        let mut sink = TextSink::new(Box::new(buffer.clone()));
        let mut sum = transfer(1, 0.0, 1.0, 1470);
        sum.scope = ReportScope::Sum;
        sink.transfer(&transfer(1, 0.0, 1.0, 1470)).unwrap();
        sink.transfer(&sum).unwrap();

        let text = buffer.text();
        assert_eq!(text.matches("[ ID]").count(), 1);
        assert!(text.contains("[SUM]"));
    }

    #[test]
    fn test_json_sink_writes_run_header_and_records() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut sink = JsonSink::create(temp_file.path(), "run-1").unwrap();
        sink.settings(&StreamSettings::new(Role::Server, Protocol::Udp))
            .unwrap();
        sink.transfer(&transfer(1, 0.0, 1.0, 1470)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.records(), 3);

        let lines: Vec<serde_json::Value> = BufReader::new(File::open(temp_file.path()).unwrap())
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "run");
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[1]["type"], "settings");
        assert_eq!(lines[2]["type"], "transfer");
        assert_eq!(lines[2]["bytes"], 1470);
    }

    #[test]
    fn test_memory_sink_clones_share_storage() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.transfer(&transfer(1, 0.0, 1.0, 10)).unwrap();
        let mut last = transfer(1, 0.0, 1.0, 10);
        last.kind = ReportKind::Final;
        writer.transfer(&last).unwrap();
        writer.flush().unwrap();

        assert_eq!(sink.transfers().len(), 2);
        assert_eq!(
            sink.transfers_where(ReportScope::Stream, ReportKind::Final).len(),
            1
        );
        assert_eq!(sink.flushes(), 1);
    }
}

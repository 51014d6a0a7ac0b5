//! # Utility Functions and Helper Module
//!
//! Formatting helpers used by the report sinks, clock helpers used by the
//! packet timestamps, and small validators shared by the CLI and the
//! configuration layer.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: transfer sizes, bit rates, packet rates and durations in
//!   the style network measurement tools print them
//! - **Validation**: parameter checks with clear error messages
//! - **System Information**: run identifiers and CPU detection for the JSON
//!   run header
//!
//! ## Usage Examples
//!
//! ```rust
//! use netmeter::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_bytes(1_572_864), "1.50 MBytes");
//! assert_eq!(format_bits_rate(94_500_000.0), "94.5 Mbits/sec");
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique identifier for a test run
///
/// The identifier is carried in the JSON run header so that the reports of
/// one invocation can be correlated after the fact.
///
/// ## Returns
/// String representation of a UUID v4
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp as nanoseconds since Unix epoch
///
/// ## Returns
/// Number of nanoseconds since January 1, 1970, 00:00:00 UTC
///
/// ## Error Handling
///
/// If the system time is before the Unix epoch, returns 0 rather than
/// panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: compound format (e.g., "5m 30s")
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a transferred byte count
///
/// Uses binary (1024-based) scaling, the convention for transfer totals in
/// interval reports.
///
/// ## Examples
///
/// ```rust
/// # use netmeter::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 Bytes");
/// assert_eq!(format_bytes(1536), "1.50 KBytes");
/// assert_eq!(format_bytes(2_621_440), "2.50 MBytes");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} Bytes", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KBytes", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MBytes", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GBytes", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a bit rate
///
/// Rates use decimal (1000-based) scaling, as link speeds do. Three
/// significant digits are kept for scaled units.
///
/// ## Examples
///
/// ```rust
/// # use netmeter::utils::format_bits_rate;
/// assert_eq!(format_bits_rate(750.0), "750 bits/sec");
/// assert_eq!(format_bits_rate(1_250_000.0), "1.25 Mbits/sec");
/// assert_eq!(format_bits_rate(9_410_000_000.0), "9.41 Gbits/sec");
/// ```
pub fn format_bits_rate(bits_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["Kbits/sec", "Mbits/sec", "Gbits/sec", "Tbits/sec"];

    if bits_per_second < 1000.0 {
        return format!("{:.0} bits/sec", bits_per_second);
    }

    let mut value = bits_per_second;
    let mut unit = UNITS[0];
    for candidate in UNITS {
        value /= 1000.0;
        unit = candidate;
        if value < 1000.0 {
            break;
        }
    }

    if value < 10.0 {
        format!("{:.2} {}", value, unit)
    } else if value < 100.0 {
        format!("{:.1} {}", value, unit)
    } else {
        format!("{:.0} {}", value, unit)
    }
}

/// Format a packet rate
///
/// ## Examples
///
/// ```rust
/// # use netmeter::utils::format_packet_rate;
/// assert_eq!(format_packet_rate(750.0), "750 pps");
/// assert_eq!(format_packet_rate(15_500.0), "15.50K pps");
/// ```
pub fn format_packet_rate(packets_per_second: f64) -> String {
    if packets_per_second < 1000.0 {
        format!("{:.0} pps", packets_per_second)
    } else if packets_per_second < 1_000_000.0 {
        format!("{:.2}K pps", packets_per_second / 1000.0)
    } else {
        format!("{:.2}M pps", packets_per_second / 1_000_000.0)
    }
}

/// Format a latency given in seconds as milliseconds with three decimals.
pub fn format_latency_ms(seconds: f64) -> String {
    format!("{:.3}", seconds * 1e3)
}

/// Loss percentage, guarding against an empty denominator.
pub fn loss_percent(lost: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        100.0 * lost as f64 / total as f64
    }
}

/// Validate the per-call buffer length
///
/// ## Validation Rules
///
/// - **Minimum**: 1 byte
/// - **Maximum**: 64 MiB, larger than any socket read or write
pub fn validate_buffer_len(buffer_len: usize) -> Result<()> {
    const MAX_BUFFER_LEN: usize = 64 * 1024 * 1024;

    if buffer_len == 0 {
        return Err(anyhow::anyhow!("Buffer length must be greater than 0"));
    }

    if buffer_len > MAX_BUFFER_LEN {
        return Err(anyhow::anyhow!(
            "Buffer length {} exceeds maximum of {} bytes",
            buffer_len,
            MAX_BUFFER_LEN
        ));
    }

    Ok(())
}

/// Validate the number of parallel streams
///
/// Each stream is an OS thread plus a ring, so the upper bound keeps a typo
/// from exhausting the process.
pub fn validate_parallel(parallel: usize) -> Result<()> {
    if parallel == 0 {
        return Err(anyhow::anyhow!("Parallel stream count must be at least 1"));
    }

    if parallel > 1024 {
        return Err(anyhow::anyhow!(
            "Parallel stream count {} exceeds maximum of 1024",
            parallel
        ));
    }

    Ok(())
}

/// Get the number of logical CPU cores
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test duration formatting with various time scales
    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 Bytes");
        assert_eq!(format_bytes(1536), "1.50 KBytes");
        assert_eq!(format_bytes(1_572_864), "1.50 MBytes");
        assert_eq!(format_bytes(1_610_612_736), "1.50 GBytes");
    }

    /// Test bit rate formatting at every unit boundary
    #[test]
    fn test_format_bits_rate() {
        assert_eq!(format_bits_rate(0.0), "0 bits/sec");
        assert_eq!(format_bits_rate(999.0), "999 bits/sec");
        assert_eq!(format_bits_rate(1000.0), "1.00 Kbits/sec");
        assert_eq!(format_bits_rate(94_500_000.0), "94.5 Mbits/sec");
        assert_eq!(format_bits_rate(941_000_000.0), "941 Mbits/sec");
        assert_eq!(format_bits_rate(2.5e12), "2.50 Tbits/sec");
    }

    #[test]
    fn test_format_packet_rate() {
        assert_eq!(format_packet_rate(500.0), "500 pps");
        assert_eq!(format_packet_rate(1500.0), "1.50K pps");
        assert_eq!(format_packet_rate(1_500_000.0), "1.50M pps");
    }

    #[test]
    fn test_loss_percent() {
        assert_eq!(loss_percent(0, 0), 0.0);
        assert!((loss_percent(1, 4) - 25.0).abs() < 1e-12);
        assert_eq!(format_latency_ms(0.00125), "1.250");
    }

    #[test]
    fn test_validate_buffer_len() {
        assert!(validate_buffer_len(1).is_ok());
        assert!(validate_buffer_len(128 * 1024).is_ok());
        assert!(validate_buffer_len(0).is_err());
        assert!(validate_buffer_len(64 * 1024 * 1024 + 1).is_err());
    }

    #[test]
    fn test_validate_parallel() {
        assert!(validate_parallel(1).is_ok());
        assert!(validate_parallel(8).is_ok());
        assert!(validate_parallel(0).is_err());
        assert!(validate_parallel(1025).is_err());
    }

    #[test]
    fn test_run_id_and_cpu_cores() {
        assert_ne!(generate_run_id(), generate_run_id());
        assert!(get_cpu_cores() > 0);
        assert!(current_timestamp_ns() > 0);
    }
}

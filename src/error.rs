//! Error types for the reporting engine.
//!
//! Only construction-time failures are errors. Everything that can go wrong
//! while traffic is flowing (failed writes, sequence gaps, skewed clocks, a
//! saturated reporter) is recorded as data in the reports instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("invalid packet ring capacity: {0} (must be at least 1)")]
    InvalidRingCapacity(usize),

    #[error("invalid histogram configuration: {0}")]
    InvalidHistogram(String),

    #[error("invalid group size: {0} (a group needs at least one stream)")]
    InvalidGroupSize(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("reporter thread is not running")]
    ReporterUnavailable,

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("test interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, ReportError>;

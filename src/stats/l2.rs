//! Link-layer validation counters.

use super::IntervalAccumulator;
use crate::packet::L2Flags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Snapshot {
    pub total: u64,
    pub unknown: u64,
    pub checksum_errors: u64,
    pub length_errors: u64,
}

impl L2Snapshot {
    pub fn errors(&self) -> u64 {
        self.unknown + self.checksum_errors + self.length_errors
    }

    pub fn combine(&self, other: &L2Snapshot) -> L2Snapshot {
        L2Snapshot {
            total: self.total + other.total,
            unknown: self.unknown + other.unknown,
            checksum_errors: self.checksum_errors + other.checksum_errors,
            length_errors: self.length_errors + other.length_errors,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct L2Stats {
    interval: L2Snapshot,
    total: L2Snapshot,
}

impl L2Stats {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntervalAccumulator for L2Stats {
    type Sample = L2Flags;
    type Snapshot = L2Snapshot;

    fn update(&mut self, flags: L2Flags) {
        self.interval.total += 1;
        if flags.contains(L2Flags::UNKNOWN) {
            self.interval.unknown += 1;
        }
        if flags.contains(L2Flags::LENGTH_ERROR) {
            self.interval.length_errors += 1;
        }
        if flags.contains(L2Flags::CHECKSUM_ERROR) {
            self.interval.checksum_errors += 1;
        }
    }

    fn interval(&self) -> L2Snapshot {
        self.interval
    }

    fn total(&self) -> L2Snapshot {
        self.total.combine(&self.interval)
    }

    fn merge_into_total(&mut self) {
        self.total = self.total.combine(&self.interval);
    }

    fn reset_interval(&mut self) {
        self.interval = L2Snapshot::default();
    }
}

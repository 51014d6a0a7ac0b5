//! Group sums for parallel streams.
//!
//! Member streams report each interval independently. Reports for the same
//! interval slot (`floor(start / interval)`) are collected until every member
//! has either reported that slot or closed, and are then folded into one sum
//! report. The final sum is produced once every member has delivered its
//! final report. Whatever is still pending at shutdown is flushed as is.

use super::{ReportKind, ReportScope, TransferInfo};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Guard against `start / interval` landing just below an integer.
const SLOT_EPSILON: f64 = 1e-9;

#[derive(Debug, Default)]
struct PendingSlot {
    reported: HashSet<u64>,
    sum: Option<TransferInfo>,
}

impl PendingSlot {
    fn add(&mut self, stream_id: u64, report: &TransferInfo) {
        self.reported.insert(stream_id);
        match self.sum.as_mut() {
            Some(sum) => sum.accumulate(report),
            None => self.sum = Some(as_sum(report)),
        }
    }
}

#[derive(Debug)]
pub struct GroupSum {
    group_id: u64,
    members: usize,
    interval: Option<Duration>,
    slots: BTreeMap<u64, PendingSlot>,
    closed: HashSet<u64>,
    final_sum: Option<TransferInfo>,
    complete: bool,
}

impl GroupSum {
    pub fn new(group_id: u64, members: usize, interval: Option<Duration>) -> Self {
        Self {
            group_id,
            members,
            interval,
            slots: BTreeMap::new(),
            closed: HashSet::new(),
            final_sum: None,
            complete: false,
        }
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// All members closed and the final sum has been emitted.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn slot_of(&self, start: f64) -> u64 {
        match self.interval {
            Some(interval) if !interval.is_zero() => {
                (start / interval.as_secs_f64() + SLOT_EPSILON).floor().max(0.0) as u64
            }
            _ => 0,
        }
    }

    /// Feed one member report; returns the sum reports it completed, oldest
    /// slot first, with the final sum last.
    pub fn add(&mut self, report: &TransferInfo) -> Vec<TransferInfo> {
        let Some(stream_id) = report.stream_id else {
            return Vec::new();
        };
        match report.kind {
            ReportKind::Interval => {
                let slot = self.slot_of(report.start);
                self.slots.entry(slot).or_default().add(stream_id, report);
                self.drain_complete_slots()
            }
            ReportKind::Final => {
                self.closed.insert(stream_id);
                match self.final_sum.as_mut() {
                    Some(sum) => sum.accumulate(report),
                    None => self.final_sum = Some(as_sum(report)),
                }
                let mut out = self.drain_complete_slots();
                if self.closed.len() >= self.members {
                    out.extend(self.flush());
                }
                out
            }
        }
    }

    fn drain_complete_slots(&mut self) -> Vec<TransferInfo> {
        let ready: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.reported.union(&self.closed).count() >= self.members)
            .map(|(key, _)| *key)
            .collect();

        ready
            .into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .filter_map(|slot| slot.sum)
            .map(finish_sum)
            .collect()
    }

    /// Emit everything still pending: incomplete interval slots, then the
    /// final sum if any member delivered one.
    pub fn flush(&mut self) -> Vec<TransferInfo> {
        let mut out: Vec<TransferInfo> = std::mem::take(&mut self.slots)
            .into_values()
            .filter_map(|slot| slot.sum)
            .map(finish_sum)
            .collect();
        if let Some(sum) = self.final_sum.take() {
            out.push(finish_sum(sum));
        }
        self.complete = true;
        out
    }
}

fn as_sum(report: &TransferInfo) -> TransferInfo {
    let mut sum = report.clone();
    sum.scope = ReportScope::Sum;
    sum.stream_id = None;
    sum.socket = -1;
    sum.percentiles = Vec::new();
    sum.members = 1;
    sum
}

/// Jitter of a sum is the mean of its members' jitter.
fn finish_sum(mut sum: TransferInfo) -> TransferInfo {
    if sum.members > 1 {
        sum.jitter /= sum.members as f64;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::transfer;

    fn final_report(stream_id: u64, end: f64, bytes: u64) -> TransferInfo {
        let mut info = transfer(stream_id, 0.0, end, bytes);
        info.kind = ReportKind::Final;
        info
    }

    #[test]
    fn test_slot_emits_when_all_members_report() {
        let mut group = GroupSum::new(1, 3, Some(Duration::from_secs(1)));
        assert!(group.add(&transfer(1, 0.0, 1.0, 1470)).is_empty());
        assert!(group.add(&transfer(2, 0.0, 1.0, 1470)).is_empty());

        let sums = group.add(&transfer(3, 0.0, 1.0, 1470));
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].scope, ReportScope::Sum);
        assert_eq!(sums[0].stream_id, None);
        assert_eq!(sums[0].bytes, 3 * 1470);
        assert_eq!(sums[0].members, 3);
    }

    #[test]
    fn test_slot_key_tolerates_float_error() {
        let group = GroupSum::new(1, 2, Some(Duration::from_millis(100)));
        assert_eq!(group.slot_of(0.3), 3);
        assert_eq!(group.slot_of(0.29999999999), 3);
        assert_eq!(group.slot_of(0.0), 0);
    }

    #[test]
    fn test_closed_member_counts_as_reported() {
        let mut group = GroupSum::new(1, 2, Some(Duration::from_secs(1)));
        assert!(group.add(&transfer(1, 0.0, 0.4, 100)).is_empty());
        assert!(group.add(&final_report(1, 0.4, 100)).is_empty());

        let sums = group.add(&transfer(2, 0.0, 1.0, 200));
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].bytes, 300);

        // A later slot only needs the surviving member.
        let sums = group.add(&transfer(2, 1.0, 2.0, 50));
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].bytes, 50);
        assert_eq!(sums[0].members, 1);

        let sums = group.add(&final_report(2, 2.0, 250));
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].kind, ReportKind::Final);
        assert_eq!(sums[0].bytes, 350);
        assert!(group.is_complete());
    }

    #[test]
    fn test_jitter_is_averaged() {
        let mut group = GroupSum::new(1, 2, None);
        let mut a = final_report(1, 1.0, 10);
        a.jitter = 0.002;
        let mut b = final_report(2, 1.0, 10);
        b.jitter = 0.004;
        assert!(group.add(&a).is_empty());
        let sums = group.add(&b);
        assert!((sums[0].jitter - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_flush_emits_incomplete() {
        let mut group = GroupSum::new(1, 3, Some(Duration::from_secs(1)));
        group.add(&transfer(1, 0.0, 1.0, 10));
        group.add(&transfer(1, 1.0, 2.0, 20));
        group.add(&final_report(1, 2.0, 30));

        let flushed = group.flush();
        assert_eq!(flushed.len(), 3);
        assert_eq!(flushed[0].bytes, 10);
        assert_eq!(flushed[1].bytes, 20);
        assert_eq!(flushed[2].kind, ReportKind::Final);
        assert!(group.is_complete());
        assert!(group.flush().is_empty());
    }
}

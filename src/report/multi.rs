//! Shared state of a group of parallel streams.
//!
//! Every traffic thread of a `-P` style test holds an `Arc<MultiHeader>`.
//! The header provides:
//!
//! - a reusable start barrier so that all members begin together and the
//!   group shares one start time
//! - a reporter-ready signal so that no member starts sending before the
//!   reporter has adopted its stream
//!
//! Both waits are bounded and re-check the test's interrupt flag, so an
//! interrupted test never leaves a thread parked forever.

use crate::error::{ReportError, Result};
use crate::packet::Timestamp;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const BARRIER_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct BarrierState {
    count: usize,
    generation: u64,
}

#[derive(Debug)]
pub struct MultiHeader {
    group_id: u64,
    thread_count: usize,
    barrier: Mutex<BarrierState>,
    barrier_cond: Condvar,
    /// Streams of this group the reporter has adopted.
    adopted: Mutex<usize>,
    adopted_cond: Condvar,
    start_time: AtomicI64,
    registered: AtomicUsize,
    interrupted: Arc<AtomicBool>,
}

impl MultiHeader {
    /// Create the header for `thread_count` parallel streams.
    ///
    /// ## Errors
    /// `ReportError::InvalidGroupSize` when `thread_count` is zero.
    pub fn new(group_id: u64, thread_count: usize, interrupted: Arc<AtomicBool>) -> Result<Self> {
        if thread_count == 0 {
            return Err(ReportError::InvalidGroupSize(thread_count));
        }
        Ok(Self {
            group_id,
            thread_count,
            barrier: Mutex::new(BarrierState::default()),
            barrier_cond: Condvar::new(),
            adopted: Mutex::new(0),
            adopted_cond: Condvar::new(),
            start_time: AtomicI64::new(0),
            registered: AtomicUsize::new(0),
            interrupted,
        })
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Common start time, set when the barrier first releases.
    pub fn start_time(&self) -> Option<Timestamp> {
        let nanos = self.start_time.load(Ordering::Acquire);
        (nanos != 0).then(|| Timestamp::from_nanos(nanos))
    }

    pub fn set_start_time(&self, t: Timestamp) {
        let _ = self.start_time.compare_exchange(
            0,
            t.as_nanos(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Block until all `thread_count` members have arrived.
    ///
    /// Returns `Ok(true)` on the thread whose arrival released the barrier.
    /// The barrier resets itself and can be reused for the next phase.
    ///
    /// ## Errors
    /// `ReportError::Interrupted` when the test is interrupted while waiting;
    /// the caller's arrival is withdrawn.
    pub fn barrier_wait(&self) -> Result<bool> {
        let mut state = self.barrier.lock();
        let generation = state.generation;
        state.count += 1;

        if state.count == self.thread_count {
            state.count = 0;
            state.generation = state.generation.wrapping_add(1);
            self.set_start_time(Timestamp::now());
            debug!(
                "group {} barrier released (generation {})",
                self.group_id, generation
            );
            self.barrier_cond.notify_all();
            return Ok(true);
        }

        loop {
            self.barrier_cond.wait_for(&mut state, BARRIER_WAIT);
            if state.generation != generation {
                return Ok(false);
            }
            if self.is_interrupted() {
                state.count -= 1;
                return Err(ReportError::Interrupted);
            }
        }
    }

    /// Count a stream registration against this group.
    ///
    /// ## Errors
    /// `ReportError::InvalidGroupSize` once more streams register than the
    /// group was created for.
    pub fn register_member(&self) -> Result<usize> {
        let index = self.registered.fetch_add(1, Ordering::AcqRel);
        if index >= self.thread_count {
            self.registered.fetch_sub(1, Ordering::AcqRel);
            return Err(ReportError::InvalidGroupSize(index + 1));
        }
        Ok(index)
    }

    /// Give back a slot taken by [`register_member`](Self::register_member)
    /// whose stream never reached the reporter.
    pub fn unregister_member(&self) {
        let _ = self
            .registered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let _adopted = self.adopted.lock();
        self.adopted_cond.notify_all();
    }

    /// Called by the reporter thread when it adopts a member stream.
    pub fn mark_adopted(&self) {
        let mut adopted = self.adopted.lock();
        *adopted += 1;
        self.adopted_cond.notify_all();
    }

    pub fn adopted(&self) -> usize {
        *self.adopted.lock()
    }

    /// Block until the reporter has adopted every registered member.
    ///
    /// ## Errors
    /// `ReportError::Interrupted` when the test is interrupted while waiting.
    pub fn await_reporter_ready(&self) -> Result<()> {
        let mut adopted = self.adopted.lock();
        loop {
            let registered = self.registered.load(Ordering::Acquire);
            if registered > 0 && *adopted >= registered {
                return Ok(());
            }
            if self.is_interrupted() {
                return Err(ReportError::Interrupted);
            }
            self.adopted_cond.wait_for(&mut adopted, BARRIER_WAIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn header(k: usize) -> (Arc<MultiHeader>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Arc::new(MultiHeader::new(1, k, Arc::clone(&flag)).unwrap()),
            flag,
        )
    }

    #[test]
    fn test_zero_members_rejected() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(matches!(
            MultiHeader::new(1, 0, flag),
            Err(ReportError::InvalidGroupSize(0))
        ));
    }

    #[test]
    fn test_barrier_releases_all_members_once() {
        let (multi, _) = header(4);
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let multi = Arc::clone(&multi);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    if multi.barrier_wait().unwrap() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(leaders.load(Ordering::SeqCst), 1);
        assert!(multi.start_time().is_some());
    }

    #[test]
    fn test_barrier_is_reusable_and_keeps_first_start() {
        let (multi, _) = header(1);
        assert!(multi.barrier_wait().unwrap());
        let first = multi.start_time();
        assert!(multi.barrier_wait().unwrap());
        assert_eq!(multi.start_time(), first);
    }

    #[test]
    fn test_interrupt_unblocks_barrier() {
        let (multi, flag) = header(2);
        let waiter = {
            let multi = Arc::clone(&multi);
            thread::spawn(move || multi.barrier_wait())
        };
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);

        assert!(matches!(
            waiter.join().unwrap(),
            Err(ReportError::Interrupted)
        ));
        assert!(multi.start_time().is_none());
    }

    #[test]
    fn test_registration_is_bounded() {
        let (multi, _) = header(2);
        assert_eq!(multi.register_member().unwrap(), 0);
        assert_eq!(multi.register_member().unwrap(), 1);
        assert!(multi.register_member().is_err());

        multi.unregister_member();
        assert_eq!(multi.register_member().unwrap(), 1);
    }

    #[test]
    fn test_unregister_releases_ready_wait() {
        let (multi, _) = header(2);
        multi.register_member().unwrap();
        multi.register_member().unwrap();
        multi.mark_adopted();

        let waiter = {
            let multi = Arc::clone(&multi);
            thread::spawn(move || multi.await_reporter_ready())
        };
        multi.unregister_member();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_await_reporter_ready() {
        let (multi, _) = header(2);
        multi.register_member().unwrap();
        multi.register_member().unwrap();

        let adopter = {
            let multi = Arc::clone(&multi);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                multi.mark_adopted();
                multi.mark_adopted();
            })
        };
        multi.await_reporter_ready().unwrap();
        assert_eq!(multi.adopted(), 2);
        adopter.join().unwrap();
    }
}

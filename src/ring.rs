//! # Packet Ring
//!
//! Bounded single-producer/single-consumer channel that carries
//! [`PacketEvent`]s from one traffic thread to the reporter thread.
//!
//! ## Layout
//!
//! The ring is a fixed array of event slots plus two monotonically increasing
//! counters. The slot for counter value `n` is `n % capacity`.
//!
//! - empty: `producer == consumer`
//! - full: `producer - consumer == capacity`
//!
//! Only the producer advances `producer` and only the consumer advances
//! `consumer`; both are atomics so the other side never observes a torn value.
//! The split into a [`PacketProducer`] and a [`PacketConsumer`] handle, neither
//! of which is `Clone`, is what makes the unsynchronised slot access sound.
//!
//! ## Signalling
//!
//! - `await_consumer`: a producer waiting for free space sleeps here and is
//!   woken by the consumer after every non-empty drain.
//! - `awake_consumer`: a [`ConsumerWake`] shared by every ring of a reporter.
//!   Producers raise it when the ring crosses half full, when it is full, and
//!   when the stream ends, so the reporter does not have to spin.
//!
//! The hot path (`try_enqueue`) touches only the two counters and one slot.

use crate::config::EnqueuePolicy;
use crate::error::{ReportError, Result};
use crate::packet::PacketEvent;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single wait inside `enqueue_blocking`; the loop re-checks
/// the interrupt flag and the consumer's liveness after each wait.
const AWAIT_CONSUMER_TIMEOUT: Duration = Duration::from_millis(100);

/// Wake-up signal the reporter thread sleeps on between passes.
#[derive(Debug, Default)]
pub struct ConsumerWake {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl ConsumerWake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the reporter (or make its next wait return immediately).
    pub fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Sleep until notified or until `timeout` elapses.
    ///
    /// Returns `true` if a notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Shared state of one ring. Reached only through the two handles.
pub struct PacketRing {
    slots: Box<[UnsafeCell<PacketEvent>]>,
    capacity: usize,
    producer: CachePadded<AtomicUsize>,
    consumer: CachePadded<AtomicUsize>,
    consumer_done: AtomicBool,
    consumer_gone: AtomicBool,
    await_counter: AtomicU64,
    dropped: AtomicU64,
    await_lock: Mutex<()>,
    await_consumer: Condvar,
    awake_consumer: Arc<ConsumerWake>,
}

// SAFETY: slot access is partitioned between exactly one producer handle and
// one consumer handle. A slot is written only while it is outside
// [consumer, producer) and read only while inside it; the Release/Acquire pairs
// on the counters publish the slot contents across threads.
unsafe impl Sync for PacketRing {}
unsafe impl Send for PacketRing {}

impl PacketRing {
    /// Allocate a ring of `capacity` slots and split it into its two ends.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(
        capacity: usize,
        awake_consumer: Arc<ConsumerWake>,
    ) -> Result<(PacketProducer, PacketConsumer)> {
        if capacity == 0 {
            return Err(ReportError::InvalidRingCapacity(capacity));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(PacketEvent::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let ring = Arc::new(PacketRing {
            slots,
            capacity,
            producer: CachePadded::new(AtomicUsize::new(0)),
            consumer: CachePadded::new(AtomicUsize::new(0)),
            consumer_done: AtomicBool::new(false),
            consumer_gone: AtomicBool::new(false),
            await_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            await_lock: Mutex::new(()),
            await_consumer: Condvar::new(),
            awake_consumer,
        });

        Ok((
            PacketProducer {
                ring: Arc::clone(&ring),
                interrupt: None,
                done: false,
            },
            PacketConsumer { ring },
        ))
    }

    fn occupancy(&self) -> usize {
        let head = self.producer.load(Ordering::Acquire);
        let tail = self.consumer.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    fn wake_producer(&self) {
        let _guard = self.await_lock.lock();
        self.await_consumer.notify_all();
    }
}

/// Producer end, owned by the traffic thread.
pub struct PacketProducer {
    ring: Arc<PacketRing>,
    interrupt: Option<Arc<AtomicBool>>,
    done: bool,
}

impl PacketProducer {
    /// Make blocking waits give up once `flag` is raised.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.ring.capacity
    }

    /// Append `event` if there is room. Never blocks.
    pub fn try_enqueue(&mut self, event: PacketEvent) -> bool {
        let ring = &*self.ring;
        let head = ring.producer.load(Ordering::Relaxed);
        let tail = ring.consumer.load(Ordering::Acquire);
        let used = head.wrapping_sub(tail);
        if used >= ring.capacity {
            return false;
        }

        // SAFETY: slot `head` is outside [tail, head) so the consumer is not
        // reading it, and we are the only producer.
        unsafe {
            *ring.slots[head % ring.capacity].get() = event;
        }
        ring.producer.store(head.wrapping_add(1), Ordering::Release);

        if used + 1 == ring.capacity / 2 {
            ring.awake_consumer.notify();
        }
        true
    }

    /// Append `event`, waiting for the consumer to free a slot if needed.
    ///
    /// Returns `false` (and counts the event as dropped) only when the wait is
    /// abandoned because the test was interrupted or the consumer went away.
    pub fn enqueue_blocking(&mut self, event: PacketEvent) -> bool {
        if self.try_enqueue(event) {
            return true;
        }

        self.ring.await_counter.fetch_add(1, Ordering::Relaxed);
        loop {
            self.signal_consumer();
            {
                let mut guard = self.ring.await_lock.lock();
                if self.is_full() && !self.abandoned() {
                    self.ring
                        .await_consumer
                        .wait_for(&mut guard, AWAIT_CONSUMER_TIMEOUT);
                }
            }
            if self.try_enqueue(event) {
                return true;
            }
            if self.abandoned() {
                self.ring.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
    }

    /// Append `event` according to `policy`.
    pub fn enqueue(&mut self, event: PacketEvent, policy: EnqueuePolicy) -> bool {
        match policy {
            EnqueuePolicy::Block => self.enqueue_blocking(event),
            EnqueuePolicy::Spin { attempts } => {
                let backoff = Backoff::new();
                for _ in 0..attempts.max(1) {
                    if self.try_enqueue(event) {
                        return true;
                    }
                    backoff.snooze();
                }
                self.ring.await_counter.fetch_add(1, Ordering::Relaxed);
                self.ring.dropped.fetch_add(1, Ordering::Relaxed);
                self.signal_consumer();
                false
            }
            EnqueuePolicy::Drop => {
                if self.try_enqueue(event) {
                    return true;
                }
                self.ring.dropped.fetch_add(1, Ordering::Relaxed);
                self.signal_consumer();
                false
            }
        }
    }

    /// Wake the reporter thread.
    pub fn signal_consumer(&self) {
        self.ring.awake_consumer.notify();
    }

    /// No further events will be produced. Idempotent.
    pub fn mark_done(&mut self) {
        if !self.done {
            self.done = true;
            self.ring.consumer_done.store(true, Ordering::Release);
            self.signal_consumer();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of times the producer found the ring full.
    pub fn await_count(&self) -> u64 {
        self.ring.await_counter.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }

    fn abandoned(&self) -> bool {
        self.ring.consumer_gone.load(Ordering::Acquire)
            || self
                .interrupt
                .as_ref()
                .map_or(false, |flag| flag.load(Ordering::Acquire))
    }
}

impl fmt::Debug for PacketProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketProducer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for PacketProducer {
    fn drop(&mut self) {
        self.mark_done();
    }
}

/// Consumer end, owned by the reporter thread's report header.
pub struct PacketConsumer {
    ring: Arc<PacketRing>,
}

impl PacketConsumer {
    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.occupancy()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every event currently in the ring, oldest first.
    pub fn dequeue_batch(&mut self) -> Vec<PacketEvent> {
        let mut batch = Vec::new();
        self.dequeue_into(&mut batch);
        batch
    }

    /// Append every available event to `out`; returns how many were taken.
    pub fn dequeue_into(&mut self, out: &mut Vec<PacketEvent>) -> usize {
        let ring = &*self.ring;
        let tail = ring.consumer.load(Ordering::Relaxed);
        let head = ring.producer.load(Ordering::Acquire);
        let available = head.wrapping_sub(tail);
        if available == 0 {
            return 0;
        }

        out.reserve(available);
        for offset in 0..available {
            let index = tail.wrapping_add(offset) % ring.capacity;
            // SAFETY: slots in [tail, head) were published by the producer's
            // Release store and are not written again until we advance.
            out.push(unsafe { *ring.slots[index].get() });
        }
        ring.consumer.store(head, Ordering::Release);
        ring.wake_producer();
        available
    }

    /// The producer has called `mark_done` (or was dropped).
    pub fn is_done(&self) -> bool {
        self.ring.consumer_done.load(Ordering::Acquire)
    }

    /// Done and fully drained: the stream can be retired.
    pub fn is_finished(&self) -> bool {
        self.is_done() && self.is_empty()
    }

    pub fn await_count(&self) -> u64 {
        self.ring.await_counter.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for PacketConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConsumer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("done", &self.is_done())
            .finish()
    }
}

impl Drop for PacketConsumer {
    fn drop(&mut self) {
        self.ring.consumer_gone.store(true, Ordering::Release);
        self.ring.wake_producer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Timestamp;
    use std::thread;

    fn event(id: i64) -> PacketEvent {
        PacketEvent::transfer(id, 1470, Timestamp::from_nanos(id))
    }

    fn ring(capacity: usize) -> (PacketProducer, PacketConsumer) {
        PacketRing::new(capacity, Arc::new(ConsumerWake::new())).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = PacketRing::new(0, Arc::new(ConsumerWake::new()));
        assert!(matches!(result, Err(ReportError::InvalidRingCapacity(0))));
    }

    #[test]
    fn test_fifo_exactly_once_across_batches() {
        let (mut tx, mut rx) = ring(8);
        let mut seen = Vec::new();
        let mut next = 1;

        // Interleave partial fills and drains so the counters wrap the slots.
        for round in 0..20 {
            for _ in 0..(round % 8) + 1 {
                assert!(tx.try_enqueue(event(next)));
                next += 1;
            }
            seen.extend(rx.dequeue_batch().into_iter().map(|e| e.packet_id));
        }
        seen.extend(rx.dequeue_batch().into_iter().map(|e| e.packet_id));

        let expected: Vec<i64> = (1..next).collect();
        assert_eq!(seen, expected);
        assert!(rx.dequeue_batch().is_empty());
    }

    #[test]
    fn test_try_enqueue_fails_when_full_without_corruption() {
        let (mut tx, mut rx) = ring(4);
        for id in 1..=4 {
            assert!(tx.try_enqueue(event(id)));
        }
        assert!(tx.is_full());
        assert!(!tx.try_enqueue(event(5)));

        let ids: Vec<i64> = rx.dequeue_batch().iter().map(|e| e.packet_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(tx.try_enqueue(event(5)));
    }

    #[test]
    fn test_blocking_enqueue_waits_for_drain() {
        let (mut tx, mut rx) = ring(4);
        for id in 1..=4 {
            assert!(tx.try_enqueue(event(id)));
        }

        let producer = thread::spawn(move || {
            let ok = tx.enqueue_blocking(event(5));
            (ok, tx.await_count())
        });

        thread::sleep(Duration::from_millis(50));
        let first: Vec<i64> = rx.dequeue_batch().iter().map(|e| e.packet_id).collect();
        assert_eq!(first, vec![1, 2, 3, 4]);

        let (ok, awaits) = producer.join().unwrap();
        assert!(ok);
        assert_eq!(awaits, 1);

        let second: Vec<i64> = rx.dequeue_batch().iter().map(|e| e.packet_id).collect();
        assert_eq!(second, vec![5]);
        assert!(rx.is_finished(), "dropped producer marks the ring done");
    }

    #[test]
    fn test_blocking_enqueue_gives_up_when_interrupted() {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, _rx) = ring(1);
        let mut tx = tx.with_interrupt(Arc::clone(&flag));
        assert!(tx.try_enqueue(event(1)));

        let producer = thread::spawn(move || tx.enqueue_blocking(event(2)));
        thread::sleep(Duration::from_millis(20));
        flag.store(true, Ordering::Release);
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_drop_policy_counts_discarded_events() {
        let (mut tx, rx) = ring(2);
        assert!(tx.enqueue(event(1), EnqueuePolicy::Drop));
        assert!(tx.enqueue(event(2), EnqueuePolicy::Drop));
        assert!(!tx.enqueue(event(3), EnqueuePolicy::Drop));
        assert!(!tx.enqueue(event(4), EnqueuePolicy::Spin { attempts: 3 }));
        assert_eq!(rx.dropped(), 2);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_finished_only_after_drain() {
        let (mut tx, mut rx) = ring(4);
        assert!(tx.try_enqueue(event(1)));
        tx.mark_done();
        assert!(rx.is_done());
        assert!(!rx.is_finished());
        assert_eq!(rx.dequeue_batch().len(), 1);
        assert!(rx.is_finished());
    }

    #[test]
    fn test_consumer_wake_roundtrip() {
        let wake = ConsumerWake::new();
        assert!(!wake.wait_timeout(Duration::from_millis(1)));
        wake.notify();
        assert!(wake.wait_timeout(Duration::from_secs(1)));
        assert!(!wake.wait_timeout(Duration::from_millis(1)));
    }
}

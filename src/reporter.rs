//! The reporter thread, the test context and per-stream handles.
//!
//! ## Lifecycle
//!
//! 1. [`Reporter::spawn`] starts the reporter thread for a [`TestContext`].
//! 2. Each traffic thread calls [`ReporterHandle::register_stream`], which
//!    builds the stream's packet ring and report header and hands the header
//!    to the reporter over a channel. The traffic thread keeps the
//!    [`StreamReporter`] (the producer end).
//! 3. The reporter adopts new headers, then repeatedly drains every ring,
//!    emits interval reports, feeds group sums and retires finished streams.
//!    Between passes it sleeps on a shared wake-up signal for at most
//!    [`defaults::REPORTER_QUANTUM`].
//! 4. [`ReporterHandle::shutdown`] asks the thread to exit once every
//!    registered stream has finished; [`TestContext::interrupt`] makes it
//!    close all streams immediately.

use crate::config::{EnqueuePolicy, Role, StreamSettings, SuppressFlags};
use crate::defaults;
use crate::error::{ReportError, Result};
use crate::output::ReportSink;
use crate::packet::{PacketEvent, Timestamp};
use crate::report::group::GroupSum;
use crate::report::header::ReportHeader;
use crate::report::multi::MultiHeader;
use crate::report::TransferInfo;
use crate::ring::{ConsumerWake, PacketProducer, PacketRing};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// State shared by every thread of one test run.
#[derive(Debug)]
pub struct TestContext {
    run_id: String,
    next_group_id: Mutex<u64>,
    next_stream_id: AtomicU64,
    interrupted: Arc<AtomicBool>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            run_id: crate::utils::generate_run_id(),
            next_group_id: Mutex::new(1),
            next_stream_id: AtomicU64::new(1),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stop the test: blocked producers and barrier waits give up, and the
    /// reporter closes every stream on its next pass.
    pub fn interrupt(&self) {
        if !self.interrupted.swap(true, Ordering::AcqRel) {
            info!("Test interrupted, closing all streams");
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Create the shared header for a group of `thread_count` parallel
    /// streams, with a fresh group id.
    ///
    /// ## Errors
    /// `ReportError::InvalidGroupSize` when `thread_count` is zero.
    pub fn init_multi(&self, thread_count: usize) -> Result<Arc<MultiHeader>> {
        let group_id = {
            let mut next = self.next_group_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let multi = MultiHeader::new(group_id, thread_count, self.interrupt_flag())?;
        debug!("group {} created for {} streams", group_id, thread_count);
        Ok(Arc::new(multi))
    }

    fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }
}

enum Command {
    Register(Box<ReportHeader>),
    Shutdown,
}

/// Entry point for starting the reporter thread.
pub struct Reporter;

impl Reporter {
    /// Start the reporter thread for `context`, writing to `sink`.
    ///
    /// ## Errors
    /// `ReportError::Spawn` if the thread cannot be created.
    pub fn spawn(context: Arc<TestContext>, sink: Box<dyn ReportSink>) -> Result<ReporterHandle> {
        let (commands, receiver) = unbounded();
        let wake = Arc::new(ConsumerWake::new());
        let accepting = Arc::new(Mutex::new(true));

        let reporter = ReporterLoop {
            context: Arc::clone(&context),
            sink,
            commands: receiver,
            wake: Arc::clone(&wake),
            accepting: Arc::clone(&accepting),
            headers: Vec::new(),
            groups: HashMap::new(),
            announced_groups: HashSet::new(),
            shutting_down: false,
            reports: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name("reporter".into())
            .spawn(move || reporter.run())?;

        Ok(ReporterHandle {
            context,
            commands,
            wake,
            accepting,
            thread,
        })
    }
}

/// Control handle for a running reporter thread.
pub struct ReporterHandle {
    context: Arc<TestContext>,
    commands: Sender<Command>,
    wake: Arc<ConsumerWake>,
    /// Cleared by the reporter thread, under the lock, before it stops
    /// reading commands.
    accepting: Arc<Mutex<bool>>,
    thread: JoinHandle<()>,
}

impl ReporterHandle {
    pub fn context(&self) -> &Arc<TestContext> {
        &self.context
    }

    /// Register a stream and return the handle its traffic thread reports
    /// through.
    ///
    /// ## Parameters
    /// - `settings`: the stream's configuration
    /// - `multi`: the group header when the stream is one of several parallel
    ///   streams, from [`TestContext::init_multi`]
    ///
    /// ## Errors
    /// - configuration errors from [`StreamSettings::validate`]
    /// - `ReportError::InvalidGroupSize` when the group is already full
    /// - `ReportError::ReporterUnavailable` when the reporter thread has exited
    pub fn register_stream(
        &self,
        settings: StreamSettings,
        multi: Option<Arc<MultiHeader>>,
    ) -> Result<StreamReporter> {
        settings.validate()?;

        let stream_id = self.context.next_stream_id();
        let policy = settings.enqueue_policy;
        let (producer, consumer) = PacketRing::new(settings.ring_capacity, Arc::clone(&self.wake))?;
        let producer = producer.with_interrupt(self.context.interrupt_flag());
        let header = ReportHeader::new(stream_id, settings, consumer, multi.clone())?;

        // Held until the header is queued so the reporter cannot exit in between.
        let accepting = self.accepting.lock();
        if !*accepting {
            return Err(ReportError::ReporterUnavailable);
        }
        if let Some(multi) = &multi {
            multi.register_member()?;
        }
        if self
            .commands
            .send(Command::Register(Box::new(header)))
            .is_err()
        {
            if let Some(multi) = &multi {
                multi.unregister_member();
            }
            return Err(ReportError::ReporterUnavailable);
        }
        drop(accepting);
        self.wake.notify();
        debug!("stream {} registered", stream_id);

        Ok(StreamReporter {
            stream_id,
            producer,
            policy,
            multi,
        })
    }

    /// Ask the reporter to exit once every registered stream has finished.
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_err() {
            debug!("reporter already stopped");
        }
        self.wake.notify();
    }

    /// Whether the reporter thread is still running.
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Wait for the reporter thread to exit.
    ///
    /// ## Errors
    /// `ReportError::ReporterUnavailable` if the reporter thread panicked.
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| ReportError::ReporterUnavailable)
    }
}

/// Producer-side handle of one registered stream.
#[derive(Debug)]
pub struct StreamReporter {
    stream_id: u64,
    producer: PacketProducer,
    policy: EnqueuePolicy,
    multi: Option<Arc<MultiHeader>>,
}

impl StreamReporter {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn multi(&self) -> Option<&Arc<MultiHeader>> {
        self.multi.as_ref()
    }

    /// Post one event under the stream's enqueue policy; `false` when it was
    /// dropped or the test is shutting down.
    pub fn report_packet(&mut self, event: PacketEvent) -> bool {
        self.producer.enqueue(event, self.policy)
    }

    /// Post a no-data event so that interval reports keep flowing while the
    /// stream is idle.
    pub fn post_empty(&mut self, t: Timestamp) -> bool {
        self.report_packet(PacketEvent::empty(t))
    }

    /// Wait at the group's start barrier; standalone streams pass through.
    pub fn barrier_wait(&self) -> Result<bool> {
        match &self.multi {
            Some(multi) => multi.barrier_wait(),
            None => Ok(true),
        }
    }

    /// Wait until the reporter has adopted every stream of the group.
    pub fn await_reporter_ready(&self) -> Result<()> {
        match &self.multi {
            Some(multi) => multi.await_reporter_ready(),
            None => Ok(()),
        }
    }

    pub fn await_count(&self) -> u64 {
        self.producer.await_count()
    }

    pub fn dropped(&self) -> u64 {
        self.producer.dropped()
    }

    /// No further events will be posted.
    pub fn mark_done(&mut self) {
        self.producer.mark_done();
    }

    /// Finish the stream; its final report follows once the ring drains.
    pub fn close(mut self) {
        self.producer.mark_done();
    }
}

/// Which of a stream's reports reach the sink.
#[derive(Debug, Clone, Copy)]
struct Visibility {
    data: bool,
    sums: bool,
}

impl Visibility {
    fn of(settings: &StreamSettings) -> Self {
        let SuppressFlags {
            data, server, sum, ..
        } = settings.suppress;
        Self {
            data: !(data || (server && settings.role == Role::Server)),
            sums: !sum,
        }
    }
}

struct ReporterLoop {
    context: Arc<TestContext>,
    sink: Box<dyn ReportSink>,
    commands: Receiver<Command>,
    wake: Arc<ConsumerWake>,
    accepting: Arc<Mutex<bool>>,
    headers: Vec<ReportHeader>,
    groups: HashMap<u64, GroupSum>,
    announced_groups: HashSet<u64>,
    shutting_down: bool,
    reports: Vec<TransferInfo>,
}

impl ReporterLoop {
    fn run(mut self) {
        info!("Reporter started (run {})", self.context.run_id());

        loop {
            self.adopt_pending();

            if self.context.is_interrupted() {
                *self.accepting.lock() = false;
                self.adopt_pending();
                self.close_all();
                break;
            }

            self.process_all();

            if self.shutting_down && self.headers.is_empty() && self.stop_accepting() {
                break;
            }
            self.wake.wait_timeout(defaults::REPORTER_QUANTUM);
        }

        self.flush_groups();
        if let Err(e) = self.sink.flush() {
            error!("Failed to flush reports: {}", e);
        }
        info!("Reporter stopped");
    }

    /// Stop taking registrations unless one is still queued.
    fn stop_accepting(&self) -> bool {
        let mut accepting = self.accepting.lock();
        if !self.commands.is_empty() {
            return false;
        }
        *accepting = false;
        true
    }

    fn adopt_pending(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Register(header)) => self.adopt(*header),
                Ok(Command::Shutdown) => self.shutting_down = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    break;
                }
            }
        }
    }

    fn adopt(&mut self, header: ReportHeader) {
        let suppress = header.settings().suppress;

        let announce = match header.multi() {
            Some(multi) => {
                let group_id = multi.group_id();
                self.groups.entry(group_id).or_insert_with(|| {
                    GroupSum::new(group_id, multi.thread_count(), header.settings().interval)
                });
                self.announced_groups.insert(group_id)
            }
            None => true,
        };
        if announce && !suppress.settings {
            if let Err(e) = self.sink.settings(header.settings()) {
                error!("Failed to write settings: {}", e);
            }
        }
        if !suppress.connection {
            if let Err(e) = self.sink.connection(&header.connection_info()) {
                error!("Failed to write connection report: {}", e);
            }
        }

        debug!("stream {} adopted", header.stream_id());
        let multi = header.multi().cloned();
        self.headers.push(header);
        if let Some(multi) = multi {
            multi.mark_adopted();
        }
    }

    fn process_all(&mut self) {
        let mut reports = std::mem::take(&mut self.reports);
        for i in 0..self.headers.len() {
            let header = &mut self.headers[i];
            header.process(&mut reports);
            let visibility = Visibility::of(header.settings());
            let group_id = header.multi().map(|m| m.group_id());
            self.route(visibility, group_id, &mut reports);
        }
        self.reports = reports;
        self.retire();
    }

    fn close_all(&mut self) {
        let mut reports = std::mem::take(&mut self.reports);
        for i in 0..self.headers.len() {
            let header = &mut self.headers[i];
            header.close_now(&mut reports);
            let visibility = Visibility::of(header.settings());
            let group_id = header.multi().map(|m| m.group_id());
            self.route(visibility, group_id, &mut reports);
        }
        self.reports = reports;
        self.retire();
    }

    fn retire(&mut self) {
        let before = self.headers.len();
        self.headers.retain(|h| !h.is_finished());
        let retired = before - self.headers.len();
        if retired > 0 {
            debug!("{} stream(s) retired, {} active", retired, self.headers.len());
        }
    }

    fn route(&mut self, visibility: Visibility, group_id: Option<u64>, reports: &mut Vec<TransferInfo>) {
        for report in reports.drain(..) {
            if visibility.data {
                self.emit(&report);
            }
            let Some(group_id) = group_id else {
                continue;
            };
            let Some(group) = self.groups.get_mut(&group_id) else {
                continue;
            };
            let sums = group.add(&report);
            let complete = group.is_complete();
            if visibility.sums {
                for sum in &sums {
                    self.emit(sum);
                }
            }
            if complete {
                self.groups.remove(&group_id);
                debug!("group {} complete", group_id);
            }
        }
    }

    fn flush_groups(&mut self) {
        let mut groups: Vec<GroupSum> = self.groups.drain().map(|(_, g)| g).collect();
        groups.sort_by_key(GroupSum::group_id);
        for mut group in groups {
            let pending = group.flush();
            if !pending.is_empty() {
                warn!(
                    "group {} incomplete at shutdown, flushing {} sum report(s)",
                    group.group_id(),
                    pending.len()
                );
            }
            for sum in &pending {
                self.emit(sum);
            }
        }
    }

    fn emit(&mut self, report: &TransferInfo) {
        if let Err(e) = self.sink.transfer(report) {
            error!("Failed to write report: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::output::MemorySink;
    use crate::report::{ReportKind, ReportScope};
    use std::time::Duration;

    fn spawn() -> (Arc<TestContext>, MemorySink, ReporterHandle) {
        let context = Arc::new(TestContext::new());
        let sink = MemorySink::new();
        let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone())).unwrap();
        (context, sink, reporter)
    }

    fn ms(t: i64) -> Timestamp {
        Timestamp::from_nanos(1_700_000_000_000_000_000 + t * 1_000_000)
    }

    #[test]
    fn test_single_stream_lifecycle() {
        let (_, sink, reporter) = spawn();
        let settings = StreamSettings::new(Role::Server, Protocol::Udp)
            .with_interval(Some(Duration::from_secs(1)));
        let mut stream = reporter.register_stream(settings, None).unwrap();

        for id in 1..=2000 {
            let sent = ms(id);
            assert!(stream.report_packet(PacketEvent::datagram(id, 1470, sent, sent)));
        }
        stream.close();
        reporter.shutdown();
        reporter.join().unwrap();

        assert_eq!(sink.banners().len(), 1);
        assert_eq!(sink.connections().len(), 1);
        let finals = sink.transfers_where(ReportScope::Stream, ReportKind::Final);
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].datagrams, 2000);
        let intervals = sink.transfers_where(ReportScope::Stream, ReportKind::Interval);
        let interval_bytes: u64 = intervals.iter().map(|r| r.bytes).sum();
        assert_eq!(interval_bytes, finals[0].bytes);
        assert_eq!(sink.flushes(), 1);
    }

    #[test]
    fn test_group_ids_are_unique() {
        let context = TestContext::new();
        let a = context.init_multi(2).unwrap();
        let b = context.init_multi(2).unwrap();
        assert_ne!(a.group_id(), b.group_id());
        assert!(context.init_multi(0).is_err());
    }

    #[test]
    fn test_invalid_settings_rejected_at_registration() {
        let (_, _, reporter) = spawn();
        let settings = StreamSettings::new(Role::Client, Protocol::Tcp).with_ring_capacity(0);
        assert!(matches!(
            reporter.register_stream(settings, None),
            Err(ReportError::InvalidRingCapacity(0))
        ));
        reporter.shutdown();
        reporter.join().unwrap();
    }

    #[test]
    fn test_suppressed_data_still_sums() {
        let (context, sink, reporter) = spawn();
        let multi = context.init_multi(2).unwrap();
        let settings = StreamSettings::new(Role::Client, Protocol::Tcp).with_suppress(SuppressFlags {
            data: true,
            ..Default::default()
        });

        for _ in 0..2 {
            let mut stream = reporter
                .register_stream(settings.clone(), Some(Arc::clone(&multi)))
                .unwrap();
            stream.report_packet(PacketEvent::transfer(0, 1000, ms(0)));
            stream.report_packet(PacketEvent::transfer(0, 1000, ms(100)));
            stream.close();
        }
        reporter.shutdown();
        reporter.join().unwrap();

        let transfers = sink.transfers();
        assert!(transfers.iter().all(|t| t.scope == ReportScope::Sum));
        let sums = sink.transfers_where(ReportScope::Sum, ReportKind::Final);
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[0].bytes, 4000);
        assert_eq!(sums[0].members, 2);
        assert_eq!(sink.banners().len(), 1);
    }

    #[test]
    fn test_server_reports_can_be_hidden() {
        let hide_server = SuppressFlags {
            server: true,
            ..Default::default()
        };
        let server = StreamSettings::new(Role::Server, Protocol::Udp).with_suppress(hide_server);
        assert!(!Visibility::of(&server).data);
        assert!(Visibility::of(&server.reversed()).data);
        assert!(Visibility::of(&server).sums);
    }

    #[test]
    fn test_register_after_exit_fails() {
        let (_, _, reporter) = spawn();
        reporter.shutdown();
        let settings = StreamSettings::new(Role::Client, Protocol::Tcp);
        // Allow the reporter to observe shutdown with no streams and exit.
        std::thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            reporter.register_stream(settings, None),
            Err(ReportError::ReporterUnavailable)
        ));
        reporter.join().unwrap();
    }

    #[test]
    fn test_registration_racing_shutdown_is_never_lost() {
        let (_, sink, reporter) = spawn();
        reporter.shutdown();

        let mut accepted = 0;
        for _ in 0..200 {
            if !reporter.is_running() {
                break;
            }
            let settings = StreamSettings::new(Role::Client, Protocol::Tcp);
            match reporter.register_stream(settings, None) {
                Ok(stream) => {
                    stream.close();
                    accepted += 1;
                }
                Err(e) => {
                    assert!(matches!(e, ReportError::ReporterUnavailable));
                    break;
                }
            }
        }
        reporter.join().unwrap();

        // Every stream that registered successfully got its final report.
        assert_eq!(
            sink.transfers_where(ReportScope::Stream, ReportKind::Final).len(),
            accepted
        );
    }

    #[test]
    fn test_failed_registration_leaves_group_slot_free() {
        let context = Arc::new(TestContext::new());
        let multi = context.init_multi(1).unwrap();
        let settings = StreamSettings::new(Role::Client, Protocol::Tcp);

        let stopped = Reporter::spawn(Arc::clone(&context), Box::new(MemorySink::new())).unwrap();
        stopped.shutdown();
        while stopped.is_running() {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(matches!(
            stopped.register_stream(settings.clone(), Some(Arc::clone(&multi))),
            Err(ReportError::ReporterUnavailable)
        ));
        stopped.join().unwrap();

        // The single slot of the group is still available.
        let sink = MemorySink::new();
        let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone())).unwrap();
        let stream = reporter
            .register_stream(settings, Some(Arc::clone(&multi)))
            .unwrap();
        stream.await_reporter_ready().unwrap();
        stream.close();
        reporter.shutdown();
        reporter.join().unwrap();
        assert_eq!(sink.transfers_where(ReportScope::Sum, ReportKind::Final).len(), 1);
    }
}

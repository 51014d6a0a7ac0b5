//! One entry of the reporter thread's work list.

use super::data::ReporterData;
use super::handler::{PacketHandler, StreamHandler};
use super::multi::MultiHeader;
use super::{ConnectionInfo, TransferInfo};
use crate::config::StreamSettings;
use crate::defaults;
use crate::error::Result;
use crate::packet::{PacketEvent, Timestamp};
use crate::ring::PacketConsumer;
use std::sync::Arc;
use tracing::{debug, warn};

/// Report state of one stream: the consumer end of its packet ring, its
/// statistics and the handler that updates them.
#[derive(Debug)]
pub struct ReportHeader {
    data: ReporterData,
    handler: StreamHandler,
    consumer: PacketConsumer,
    multi: Option<Arc<MultiHeader>>,
    batch: Vec<PacketEvent>,
    /// Consecutive passes that found the ring full.
    delay_counter: u32,
    await_at_interval_start: u64,
    cpu_bound_warned: bool,
    finished: bool,
}

impl ReportHeader {
    pub fn new(
        stream_id: u64,
        settings: StreamSettings,
        consumer: PacketConsumer,
        multi: Option<Arc<MultiHeader>>,
    ) -> Result<Self> {
        let handler = StreamHandler::for_settings(&settings);
        let group_id = multi.as_ref().map(|m| m.group_id());
        let data = ReporterData::new(stream_id, group_id, settings)?;
        Ok(Self {
            data,
            handler,
            batch: Vec::with_capacity(consumer.capacity()),
            consumer,
            multi,
            delay_counter: 0,
            await_at_interval_start: 0,
            cpu_bound_warned: false,
            finished: false,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.data.stream_id
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.data.settings
    }

    pub fn multi(&self) -> Option<&Arc<MultiHeader>> {
        self.multi.as_ref()
    }

    pub fn data(&self) -> &ReporterData {
        &self.data
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.data.connection_info()
    }

    /// The stream's epoch: the group start when it precedes the first event,
    /// otherwise the first event's time.
    fn start_time_for(&self, first: &PacketEvent) -> Timestamp {
        let first_time = if first.packet_time.is_set() {
            first.packet_time
        } else {
            Timestamp::now()
        };
        match self.multi.as_ref().and_then(|m| m.start_time()) {
            Some(group_start) if group_start <= first_time => group_start,
            _ => first_time,
        }
    }

    fn is_cpu_bound(&self) -> bool {
        self.data.await_count.current > self.await_at_interval_start
            || self.delay_counter >= defaults::DELAY_THRESHOLD
    }

    fn close_interval(&mut self, end: Timestamp, out: &mut Vec<TransferInfo>) {
        let cpu_bound = self.is_cpu_bound();
        if cpu_bound && !self.cpu_bound_warned {
            warn!(
                "stream {}: reporter is falling behind, results may be CPU bound",
                self.data.stream_id
            );
            self.cpu_bound_warned = true;
        }
        out.push(self.data.close_interval(end, cpu_bound));
        self.await_at_interval_start = self.data.await_count.current;
    }

    /// Drain the ring and account every event, emitting the interval reports
    /// whose boundaries the events cross. Once the producer has finished and
    /// the ring is empty, the partial interval and the final report follow.
    ///
    /// Returns `true` when the stream is finished and can be retired.
    pub fn process(&mut self, out: &mut Vec<TransferInfo>) -> bool {
        if self.finished {
            return true;
        }

        let drained = self.consumer.dequeue_into(&mut self.batch);
        if drained == self.consumer.capacity() {
            self.delay_counter = self.delay_counter.saturating_add(1);
        } else if drained < self.consumer.capacity() / 2 {
            self.delay_counter = 0;
        }
        self.data
            .observe_ring(self.consumer.await_count(), self.consumer.dropped());

        let mut batch = std::mem::take(&mut self.batch);
        for event in batch.drain(..) {
            self.apply(&event, out);
        }
        self.batch = batch;

        if self.consumer.is_finished() {
            self.finish(out);
        }
        self.finished
    }

    fn apply(&mut self, event: &PacketEvent, out: &mut Vec<TransferInfo>) {
        if !self.data.is_started() {
            let start = self.start_time_for(event);
            self.data.start(start);
            debug!(
                "stream {} ({}) started",
                self.data.stream_id,
                self.handler.name()
            );
        }

        let t = if event.packet_time.is_set() {
            event.packet_time
        } else {
            self.data.packet_time
        };
        while self.data.interval_due(t) {
            let end = self.data.next_time;
            self.close_interval(end, out);
        }
        if t > self.data.packet_time {
            self.data.packet_time = t;
        }

        if !event.empty_report {
            self.handler.handle(&mut self.data, event);
        }
    }

    /// Emit the partial interval, if any, and the final report.
    fn finish(&mut self, out: &mut Vec<TransferInfo>) {
        if self.finished {
            return;
        }
        if !self.data.is_started() {
            self.data.start(Timestamp::now());
        }
        if self.data.interval().is_some() && self.data.has_open_interval() {
            let end = self.data.packet_time;
            self.close_interval(end, out);
        }
        out.push(self.data.final_report(self.is_cpu_bound()));
        self.finished = true;
        debug!(
            "stream {} finished: {} bytes, {} packets",
            self.data.stream_id, self.data.bytes.current, self.data.packets.current
        );
    }

    /// Drain what is left and close the stream now, whether or not the
    /// producer has finished. Used when the test is interrupted.
    pub fn close_now(&mut self, out: &mut Vec<TransferInfo>) {
        if self.finished {
            return;
        }
        let mut batch = std::mem::take(&mut self.batch);
        self.consumer.dequeue_into(&mut batch);
        self.data
            .observe_ring(self.consumer.await_count(), self.consumer.dropped());
        for event in batch.drain(..) {
            self.apply(&event, out);
        }
        self.batch = batch;
        self.finish(out);
    }
}

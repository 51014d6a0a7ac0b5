use anyhow::Result;
use netmeter::{
    ConsumerWake, EnqueuePolicy, MemorySink, PacketEvent, PacketRing, Protocol, ReportKind,
    ReportScope, Reporter, Role, StreamSettings, TestContext, Timestamp,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn event(id: i64) -> PacketEvent {
    PacketEvent::transfer(id, 100, Timestamp::from_nanos(1_000_000 * (id + 1)))
}

/// A ring of four slots refuses a fifth event, and a blocked producer resumes
/// once the consumer drains, with every event delivered once and in order.
#[test]
fn full_ring_blocks_until_drained() -> Result<()> {
    let (mut producer, mut consumer) = PacketRing::new(4, Arc::new(ConsumerWake::new()))?;
    for id in 1..=4 {
        assert!(producer.try_enqueue(event(id)));
    }
    assert!(producer.is_full());
    assert!(!producer.try_enqueue(event(5)));

    let writer = thread::spawn(move || {
        for id in 5..=20 {
            assert!(producer.enqueue(event(id), EnqueuePolicy::Block));
        }
        let awaited = producer.await_count();
        producer.mark_done();
        awaited
    });

    let mut received = Vec::new();
    while !consumer.is_finished() {
        thread::sleep(Duration::from_millis(5));
        received.extend(consumer.dequeue_batch().into_iter().map(|e| e.packet_id));
    }
    let awaited = writer.join().expect("writer panicked");

    assert_eq!(received, (1..=20).collect::<Vec<_>>());
    assert!(awaited >= 1);
    assert_eq!(consumer.dropped(), 0);
    Ok(())
}

/// Under the drop policy a full ring discards the event and counts it.
#[test]
fn drop_policy_counts_discarded_events() -> Result<()> {
    let (mut producer, mut consumer) = PacketRing::new(4, Arc::new(ConsumerWake::new()))?;
    let accepted = (1..=10)
        .filter(|&id| producer.enqueue(event(id), EnqueuePolicy::Drop))
        .count();
    assert_eq!(accepted, 4);
    assert_eq!(producer.dropped(), 6);

    let ids: Vec<i64> = consumer.dequeue_batch().iter().map(|e| e.packet_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    assert!(producer.enqueue(event(11), EnqueuePolicy::Spin { attempts: 1 }));
    assert_eq!(consumer.len(), 1);
    Ok(())
}

/// Through the reporter, a tiny ring under the blocking policy loses nothing.
#[test]
fn reporter_accounts_every_event_from_a_tiny_ring() -> Result<()> {
    let context = Arc::new(TestContext::new());
    let sink = MemorySink::new();
    let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone()))?;
    let settings = StreamSettings::new(Role::Client, Protocol::Tcp)
        .with_ring_capacity(4)
        .with_enqueue_policy(EnqueuePolicy::Block);
    let mut stream = reporter.register_stream(settings, None)?;

    for id in 0..5000 {
        assert!(stream.report_packet(event(id)));
    }
    stream.close();
    reporter.shutdown();
    reporter.join()?;

    let finals = sink.transfers_where(ReportScope::Stream, ReportKind::Final);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].packets, 5000);
    assert_eq!(finals[0].bytes, 5000 * 100);
    assert_eq!(finals[0].dropped, 0);
    Ok(())
}

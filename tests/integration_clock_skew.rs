use anyhow::Result;
use netmeter::simulate::{Pacing, SimulationConfig, SyntheticSource};
use netmeter::{
    MemorySink, PacketEvent, Protocol, ReportKind, ReportScope, Reporter, Role, StreamSettings,
    TestContext, Timestamp, TransferInfo,
};
use std::sync::Arc;
use std::time::Duration;

fn final_report(sink: &MemorySink) -> TransferInfo {
    let finals = sink.transfers_where(ReportScope::Stream, ReportKind::Final);
    assert_eq!(finals.len(), 1);
    finals[0].clone()
}

/// A datagram that appears to arrive five seconds before it was sent is
/// counted as transferred data but kept out of the latency statistics, and
/// the stream's latency is flagged as unreliable.
#[test]
fn negative_transit_is_excluded_from_latency() -> Result<()> {
    let context = Arc::new(TestContext::new());
    let sink = MemorySink::new();
    let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone()))?;
    let settings = StreamSettings::new(Role::Server, Protocol::Udp).with_enhanced(true);
    let mut stream = reporter.register_stream(settings, None)?;

    let start = Timestamp::now();
    for id in 1..=100i64 {
        let sent = start + Duration::from_millis(id as u64);
        let received = if id % 10 == 0 {
            sent - Duration::from_secs(5)
        } else {
            sent + Duration::from_millis(1)
        };
        assert!(stream.report_packet(PacketEvent::datagram(id, 1470, sent, received)));
    }
    stream.close();
    reporter.shutdown();
    reporter.join()?;

    let report = final_report(&sink);
    assert_eq!(report.datagrams, 100);
    assert_eq!(report.bytes, 100 * 1470);

    let transit = report.transit.expect("receiver reports latency");
    assert_eq!(transit.count, 90);
    assert_eq!(transit.implausible, 10);
    assert!(transit.unreliable);
    assert!((transit.min - 0.001).abs() < 1e-6);
    assert!((transit.max - 0.001).abs() < 1e-6);
    assert!((transit.mean - 0.001).abs() < 1e-6);
    Ok(())
}

/// A receiver whose clock runs five seconds behind the sender sees every
/// sample rejected.
#[test]
fn skewed_receiver_clock_marks_every_sample_implausible() -> Result<()> {
    let context = Arc::new(TestContext::new());
    let sink = MemorySink::new();
    let reporter = Reporter::spawn(Arc::clone(&context), Box::new(sink.clone()))?;
    let settings = StreamSettings::new(Role::Server, Protocol::Udp)
        .with_interval(Some(Duration::from_secs(1)));
    let mut stream = reporter.register_stream(settings.clone(), None)?;

    let simulation = SimulationConfig {
        duration: Duration::from_secs(2),
        clock_skew: -5.0,
        seed: Some(5),
        ..Default::default()
    };
    let mut source = SyntheticSource::new(settings, simulation, 0);
    let summary = source.run(&mut stream, Pacing::Virtual, &context.interrupt_flag());
    stream.close();
    reporter.shutdown();
    reporter.join()?;

    let report = final_report(&sink);
    assert_eq!(report.datagrams, summary.posted);
    let transit = report.transit.expect("receiver reports latency");
    assert_eq!(transit.count, 0);
    assert_eq!(transit.implausible, summary.posted);
    assert!(transit.unreliable);

    for interval in sink.transfers_where(ReportScope::Stream, ReportKind::Interval) {
        if let Some(transit) = interval.transit.filter(|t| t.samples() > 0) {
            assert!(transit.unreliable);
            assert_eq!(transit.count, 0);
        }
    }
    Ok(())
}

//! Hot-path benchmarks
//!
//! - packet ring: enqueue/drain cycles at several batch sizes, and a
//!   producer thread streaming into a draining consumer
//! - latency accumulation: the Welford update behind every received datagram

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netmeter::stats::RunningStats;
use netmeter::{ConsumerWake, EnqueuePolicy, LatencyWindow, PacketEvent, PacketRing, Timestamp, TransitStats};
use std::sync::Arc;
use std::thread;

fn event(id: i64) -> PacketEvent {
    let sent = Timestamp::from_nanos(1_700_000_000_000_000_000 + id * 1_000);
    PacketEvent::datagram(id, 1470, sent, sent)
}

fn bench_ring_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cycle");

    for batch in [16usize, 256, 4096] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let (mut producer, mut consumer) =
                PacketRing::new(batch, Arc::new(ConsumerWake::new())).unwrap();
            let mut out = Vec::with_capacity(batch);
            b.iter(|| {
                for id in 0..batch as i64 {
                    producer.try_enqueue(black_box(event(id)));
                }
                out.clear();
                black_box(consumer.dequeue_into(&mut out));
            });
        });
    }

    group.finish();
}

fn bench_ring_cross_thread(c: &mut Criterion) {
    const EVENTS: i64 = 100_000;
    let mut group = c.benchmark_group("ring_cross_thread");
    group.throughput(Throughput::Elements(EVENTS as u64));

    group.bench_function("blocking_producer", |b| {
        b.iter(|| {
            let (mut producer, mut consumer) =
                PacketRing::new(4096, Arc::new(ConsumerWake::new())).unwrap();
            let writer = thread::spawn(move || {
                for id in 0..EVENTS {
                    producer.enqueue(event(id), EnqueuePolicy::Block);
                }
            });
            let mut out = Vec::with_capacity(4096);
            let mut received = 0;
            while !consumer.is_finished() {
                out.clear();
                received += consumer.dequeue_into(&mut out);
            }
            writer.join().unwrap();
            black_box(received)
        });
    });

    group.finish();
}

fn bench_latency_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency_update");
    let samples: Vec<f64> = (0..10_000).map(|i| 0.001 + (i % 97) as f64 * 1e-6).collect();
    group.throughput(Throughput::Elements(samples.len() as u64));

    group.bench_function("welford", |b| {
        b.iter(|| {
            let mut stats = RunningStats::new();
            for &v in &samples {
                stats.push(black_box(v));
            }
            black_box(stats.stddev())
        });
    });

    group.bench_function("transit_with_window", |b| {
        b.iter(|| {
            let mut stats = TransitStats::new(LatencyWindow::default());
            for &v in &samples {
                stats.record(black_box(v));
            }
            black_box(stats)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_cycle,
    bench_ring_cross_thread,
    bench_latency_update
);
criterion_main!(benches);

//! Criterion benchmarks for broadcast hub fan-out.
//!
//! Publishing sits on the acquisition thread, so its cost per subscriber
//! bounds the frame rate a camera can sustain.
//!
//! Run with: cargo bench --bench hub_fanout

use std::time::Duration;

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fiberscope::broadcast::{encode_message, BroadcastHub, DeliveryPolicy, Message, Subscription};
use fiberscope::capture::{Frame, PixelFormat};

fn frame(len: usize) -> Frame {
    Frame::new(vec![0x5Au8; len], len as u32, 1, PixelFormat::Mono8, 0)
}

/// Publish cost for 1..=8 drop-oldest subscribers. Frames share one
/// buffer, so the cost should not depend on the frame size.
fn publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("hub_publish");
    let message = Message::Frame(frame(1024 * 1024));

    for subscribers in [1usize, 2, 4, 8] {
        let hub = BroadcastHub::new();
        let _subs: Vec<Subscription> = (0..subscribers)
            .map(|_| hub.subscribe("cam_free_run", DeliveryPolicy::DropOldest { capacity: 4 }))
            .collect();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(BenchmarkId::new("drop_oldest", subscribers), &subscribers, |b, _| {
            b.iter(|| hub.publish("cam_free_run", black_box(message.clone())));
        });
    }

    group.finish();
}

/// Publish plus receive through a blocking subscription.
fn publish_receive(c: &mut Criterion) {
    let hub = BroadcastHub::new();
    let sub = hub.subscribe(
        "cam_free_run",
        DeliveryPolicy::Block {
            capacity: 16,
            timeout: Duration::from_millis(20),
        },
    );
    let message = Message::Frame(frame(640 * 480));

    c.bench_function("hub_publish_receive", |b| {
        b.iter(|| {
            hub.publish("cam_free_run", message.clone());
            black_box(sub.recv_timeout(Duration::from_millis(10)).unwrap());
        });
    });
}

/// Wire framing used for process-isolated workers.
fn frame_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for (name, size) in [("64KB", 64 * 1024), ("300KB", 640 * 480), ("1MB", 1024 * 1024)] {
        let message = Message::Frame(frame(size));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", name), &message, |b, message| {
            let mut buf = BytesMut::with_capacity(size + 64);
            b.iter(|| {
                buf.clear();
                encode_message(black_box(message), &mut buf).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, publish_fanout, publish_receive, frame_encoding);
criterion_main!(benches);

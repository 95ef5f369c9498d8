//! Room fan-out benchmarks for Chatwire.

use chatwire_core::{Hub, HubConfig, ServerEvent};
use chatwire_protocol::EventKind;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn room_with_members(size: usize) -> (Hub, Vec<mpsc::Receiver<Arc<ServerEvent>>>) {
    let hub = Hub::new(HubConfig {
        // Room for every presence broadcast during setup.
        outbound_queue_capacity: size + 16,
        ..HubConfig::default()
    });
    let receivers = (0..size)
        .map(|i| {
            let (outbox, rx) = hub.open_outbox();
            let id = hub
                .on_connect(outbox, Some(format!("user-{}", i).as_str()))
                .unwrap();
            hub.join_room(&id, "chat-1").unwrap();
            rx
        })
        .collect();
    (hub, receivers)
}

fn drain(receivers: &mut [mpsc::Receiver<Arc<ServerEvent>>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Publish one message to rooms of increasing size.
fn bench_room_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_fanout");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (hub, mut receivers) = room_with_members(size);
            drain(&mut receivers);
            let payload = json!({"message_id": "m1", "text": "hello"});

            b.iter(|| {
                hub.relay().publish_to_room(
                    black_box("chat-1"),
                    EventKind::ReceiveMessage,
                    payload.clone(),
                );
                drain(&mut receivers);
            });
        });
    }

    group.finish();
}

/// Join and leave churn on a shared room.
fn bench_join_leave(c: &mut Criterion) {
    let mut group = c.benchmark_group("rooms");

    group.bench_function("join_leave", |b| {
        let (hub, _receivers) = room_with_members(100);
        let (outbox, _rx) = hub.open_outbox();
        let id = hub.on_connect(outbox, Some("churn")).unwrap();

        b.iter(|| {
            hub.join_room(&id, black_box("chat-1")).unwrap();
            hub.leave_room(&id, black_box("chat-1"));
        });
    });

    group.finish();
}

/// Encoding an event once and sharing the bytes across targets.
fn bench_event_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("event");

    group.bench_function("encode_shared", |b| {
        b.iter(|| {
            let event = ServerEvent::new(EventKind::ReceiveMessage, json!({"text": "hello"}))
                .in_room("chat-1");
            for _ in 0..100 {
                black_box(event.encoded().unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_room_fanout,
    bench_join_leave,
    bench_event_encoding,
);
criterion_main!(benches);

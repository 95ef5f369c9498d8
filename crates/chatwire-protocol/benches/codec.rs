//! Codec benchmarks for chatwire-protocol.

use chatwire_protocol::{codec, EventKind, Frame};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn message_event(text_len: usize) -> Frame {
    Frame::Event {
        id: 1,
        kind: EventKind::ReceiveMessage,
        room: Some("chat:lobby".to_string()),
        payload: json!({
            "message_id": "65f1c0ffee",
            "from": "alice",
            "text": "x".repeat(text_len),
        }),
        timestamp: 1_700_000_000_000,
    }
}

fn bench_encode(c: &mut Criterion) {
    let frame = message_event(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("msgpack_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode_json(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = message_event(64);
    let encoded = codec::encode(&frame).unwrap();
    let text = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::decode_json(black_box(&text)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = message_event(1024);

    c.bench_function("roundtrip_1KB", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_roundtrip);
criterion_main!(benches);

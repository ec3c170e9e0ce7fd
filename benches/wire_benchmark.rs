use criterion::{black_box, criterion_group, criterion_main, Criterion};
use huddle_collab::protocol::{ChatMessage, ClientEvent, CursorPos, ServerEvent};
use huddle_collab::sync::bus::UpdateBus;
use huddle_collab::sync::wire::{PeerProfile, SyncMessage};
use std::sync::Arc;
use uuid::Uuid;

fn bench_client_event_encode(c: &mut Criterion) {
    let event = ClientEvent::CodeChange {
        room_id: "bench-room".into(),
        code: "fn main() { println!(\"hello\"); }".into(),
    };

    c.bench_function("client_event_encode_code", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_client_event_decode(c: &mut Criterion) {
    let event = ClientEvent::CodeChange {
        room_id: "bench-room".into(),
        code: "fn main() { println!(\"hello\"); }".into(),
    };
    let encoded = event.encode().unwrap();

    c.bench_function("client_event_decode_code", |b| {
        b.iter(|| {
            black_box(ClientEvent::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_server_event_chat_roundtrip(c: &mut Criterion) {
    let event = ServerEvent::Chat(ChatMessage::new("Alice", "a fairly typical chat line"));

    c.bench_function("server_event_chat_roundtrip", |b| {
        b.iter(|| {
            let encoded = event.encode().unwrap();
            black_box(ServerEvent::decode(&encoded).unwrap());
        })
    });
}

fn bench_cursor_event_encode(c: &mut Criterion) {
    let event = ClientEvent::CursorMove {
        room_id: "bench-room".into(),
        cursor: CursorPos { line: 120, column: 42 },
    };

    c.bench_function("cursor_event_encode", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

fn bench_sync_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let fragment = vec![0u8; 64]; // Typical small CRDT fragment

    c.bench_function("sync_update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(peer),
                black_box("bench-room"),
                black_box(fragment.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_sync_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(Uuid::new_v4(), "bench-room", vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("sync_update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_bus_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("bus_publish_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let bus = UpdateBus::new(1024, 256);
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (rx, _) = bus.subscribe(PeerProfile::new(format!("Peer{i}"))).await;
                    receivers.push(rx);
                }

                let frame = Arc::new(vec![0u8; 64]);
                black_box(bus.publish(black_box(frame)));
            });
        })
    });
}

fn bench_bus_buffered_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("bus_publish_buffered_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let bus = UpdateBus::new(2048, 1024);
                let (_rx, _) = bus.subscribe(PeerProfile::new("Solo")).await;
                for i in 0..1000u64 {
                    let frame = Arc::new(vec![i as u8; 64]);
                    bus.publish_buffered(black_box(frame)).await;
                }
            });
        })
    });
}

criterion_group!(
    benches,
    bench_client_event_encode,
    bench_client_event_decode,
    bench_server_event_chat_roundtrip,
    bench_cursor_event_encode,
    bench_sync_update_encode,
    bench_sync_update_decode,
    bench_bus_fan_out,
    bench_bus_buffered_publish,
);
criterion_main!(benches);

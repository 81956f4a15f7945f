//! Room broadcast benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use courier_core::{Member, Outbound, Room};
use tokio::sync::mpsc;

fn room_with(members: usize) -> (Room, Vec<mpsc::Receiver<Outbound>>) {
    let room = Room::new("bench");
    let mut receivers = Vec::with_capacity(members);
    for i in 0..members {
        let (member, rx) = Member::channel(format!("member-{i}"), 1024);
        room.add_member(member).unwrap();
        receivers.push(rx);
    }
    (room, receivers)
}

fn drain(receivers: &mut [mpsc::Receiver<Outbound>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for members in [10, 100, 1000] {
        let (room, mut receivers) = room_with(members);
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                room.broadcast_message(black_box(r#"{"topic":"chat","payload":"hi"}"#))
                    .unwrap();
                drain(&mut receivers);
            })
        });
    }

    group.finish();
}

fn bench_direct(c: &mut Criterion) {
    let (room, mut receivers) = room_with(100);

    c.bench_function("send_message_to", |b| {
        b.iter(|| {
            room.send_message_to(black_box("member-42"), "hi").unwrap();
            drain(&mut receivers[42..43]);
        })
    });
}

criterion_group!(benches, bench_broadcast, bench_direct);
criterion_main!(benches);

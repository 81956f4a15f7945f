//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, metadata, Envelope};

fn envelope(size: usize) -> Envelope {
    Envelope::new("SendWsMessage", vec![b'x'; size])
        .with_metadata(metadata::SENT_AT, "1700000000000")
        .with_metadata(metadata::CORRELATION_ID, "1234567890")
}

fn bench_encode_small(c: &mut Criterion) {
    let envelope = envelope(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode(black_box(&envelope))));
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&envelope(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let envelope = envelope(4096);

    c.bench_function("roundtrip_4KiB", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&envelope)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip
);
criterion_main!(benches);

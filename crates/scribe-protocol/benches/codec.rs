//! Codec benchmarks for scribe-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use scribe_protocol::{codec, Envelope};

fn bench_encode_small(c: &mut Criterion) {
    let envelope = Envelope::patch("doc", vec![0u8; 64]);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("patch_64B", |b| {
        b.iter(|| codec::encode(black_box(&envelope)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let envelope = Envelope::patch("doc", vec![0u8; 64]);
    let encoded = codec::encode(&envelope).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("patch_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_decode_json(c: &mut Criterion) {
    let text = r#"{"documentId":"doc","kind":"cursor","payload":"128:12"}"#;

    c.bench_function("decode_json_cursor", |b| {
        b.iter(|| codec::decode_json(black_box(text)))
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    let envelope = Envelope::cursor("workspace:doc:1234", vec![0u8; 256]);

    c.bench_function("roundtrip_256B", |b| {
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
    bench_decode_json,
    bench_roundtrip
);
criterion_main!(benches);

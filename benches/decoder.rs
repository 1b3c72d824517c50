//! Benchmark suite for the data format 5 decoder.
//!
//! Isolates decoding from the async runtime and storage.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ruuvi_station::decoder::{decode, ensure_v5};

/// Manufacturer data from a real tag, company id included
const V5_PAYLOAD: [u8; 26] = [
    0x99, 0x04, // Company id 0x0499, little-endian
    0x05, // Format 5
    0x0D, 0xD3, // Temperature: 17.695°C
    0x70, 0x71, // Humidity: 71.9625%
    0xC3, 0x25, // Pressure: 99957 Pa
    0xFE, 0x88, // Acceleration X: -376 mG
    0xFC, 0x38, // Acceleration Y: -968 mG
    0xFF, 0x70, // Acceleration Z: -144 mG
    0xAC, 0x56, // Battery: 2978 mV, TX Power: 4 dBm
    0xAE, // Movement counter: 174
    0x0A, 0xEF, // Sequence: 2799
    0xF3, 0x30, 0xFE, 0x2F, 0xC2, 0xA9, // MAC address
];

/// Every optional field set to its "not reported" sentinel
fn sentinel_payload() -> Vec<u8> {
    let mut payload = V5_PAYLOAD.to_vec();
    payload[5..15].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x80, 0x00, 0x80, 0x00, 0x80, 0x00]);
    payload
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("v5", |b| b.iter(|| decode(black_box(&V5_PAYLOAD))));

    let sentinels = sentinel_payload();
    group.bench_function("v5_sentinels", |b| b.iter(|| decode(black_box(&sentinels))));

    let mut v3 = V5_PAYLOAD.to_vec();
    v3[2] = 0x03;
    group.bench_function("reject_v3", |b| {
        b.iter(|| ensure_v5(black_box(&v3)).and_then(|_| decode(black_box(&v3))))
    });

    group.bench_function("too_short", |b| b.iter(|| decode(black_box(&V5_PAYLOAD[..12]))));

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);

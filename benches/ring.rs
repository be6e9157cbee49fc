//! Produce/consume round trips through a ring in one process
//!
//! Measures the cost of the semaphore handshake plus the slot copy without
//! any cross-process scheduling noise.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringbench::bench::fill_pattern;
use ringbench::{ResourceNames, RingConfig, RingTransport, RunToken};

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for size in [64usize, 1024, 4096] {
        let token = RunToken::new(format!("crit_{}_{}", std::process::id(), size)).unwrap();
        let names = ResourceNames::new("rbbench", &token).unwrap();
        let config = RingConfig::default();
        let ring = RingTransport::create(&names, &config).unwrap();

        let mut payload = vec![0u8; size];
        fill_pattern(&mut payload);
        let mut buf = vec![0u8; config.slot_size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                ring.produce(&payload).unwrap();
                ring.consume_into(&mut buf).unwrap()
            })
        });

        ring.teardown().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);

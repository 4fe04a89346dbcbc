// Criterion benchmarks for ringrpc-client
//
// Run benchmarks with:
//   cargo bench -p ringrpc-client
//
// For detailed output with plots:
//   cargo bench -p ringrpc-client -- --save-baseline main

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ringrpc_client::HashRing;

fn ring_with(connections: usize) -> HashRing<usize> {
    let ring = HashRing::new();
    for i in 0..connections {
        ring.insert(&format!("127.0.0.1:9000#{}", i), Arc::new(i));
    }
    ring
}

fn bench_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_pick");

    for connections in [1usize, 10, 50] {
        let ring = ring_with(connections);
        group.bench_with_input(
            BenchmarkId::from_parameter(connections),
            &ring,
            |b, ring| {
                let mut request_id = 0u64;
                b.iter(|| {
                    request_id = request_id.wrapping_add(1);
                    ring.pick(black_box(request_id))
                });
            },
        );
    }

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_rebuild");

    group.bench_function("replace_10_positions_of_50", |b| {
        let ring = ring_with(50);
        let positions = HashRing::<usize>::positions_for("127.0.0.1:9000#0");
        b.iter(|| ring.replace(black_box(&positions), Arc::new(0)));
    });

    group.finish();
}

criterion_group!(benches, bench_pick, bench_rebuild);
criterion_main!(benches);

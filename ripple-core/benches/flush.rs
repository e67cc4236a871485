//! Benchmarks for ripple-core
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_core::{Equality, NodeId, Store, StoreConfig};

fn value_store() -> Store<i64> {
    Store::with_config(StoreConfig::default().with_default_equality(Equality::Value))
}

// =============================================================================
// STATE BENCHMARKS
// =============================================================================

fn bench_state_write(c: &mut Criterion) {
    let store = value_store();
    let s = store.create_state(0);
    let mut next = 0;
    c.bench_function("state_write", |b| {
        b.iter(|| {
            next += 1;
            store.write(s, black_box(next)).unwrap()
        })
    });
}

fn bench_state_write_same_value(c: &mut Criterion) {
    let store = value_store();
    let s = store.create_state(42);
    c.bench_function("state_write_same_value", |b| {
        b.iter(|| store.write(s, black_box(42)).unwrap())
    });
}

// =============================================================================
// FLUSH BENCHMARKS
// =============================================================================

fn chain(store: &Store<i64>, length: usize) -> (NodeId, NodeId) {
    let root = store.create_state(0);
    let mut last = root;
    for _ in 0..length {
        last = store.create_computed(&[last], |inputs| *inputs[0] + 1).unwrap();
    }
    (root, last)
}

fn bench_chain_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_flush");
    for length in [10, 100, 1000] {
        let store = value_store();
        let (root, tail) = chain(&store, length);
        store.read(tail).unwrap();
        let mut next = 0;

        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                next += 1;
                store.write(root, next).unwrap();
                black_box(store.read(tail).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_diamond_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamond_flush");
    for width in [2, 16, 128] {
        let store = value_store();
        let root = store.create_state(0);
        let middle: Vec<NodeId> = (0..width)
            .map(|offset| {
                store
                    .create_computed(&[root], move |inputs| *inputs[0] + offset)
                    .unwrap()
            })
            .collect();
        let sink = store
            .create_computed(&middle, |inputs| inputs.iter().map(|v| **v).sum())
            .unwrap();
        store.read(sink).unwrap();
        let mut next = 0;

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                store.write(root, next).unwrap();
                black_box(store.read(sink).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_batched_writes(c: &mut Criterion) {
    let store = value_store();
    let states: Vec<NodeId> = (0..100).map(|_| store.create_state(0)).collect();
    let total = store
        .create_computed(&states, |inputs| inputs.iter().map(|v| **v).sum())
        .unwrap();
    store.read(total).unwrap();
    let mut next = 0;

    c.bench_function("batch_100_writes", |b| {
        b.iter(|| {
            next += 1;
            store
                .batch(|| {
                    for &s in &states {
                        store.write(s, next).unwrap();
                    }
                })
                .unwrap();
            black_box(store.read(total).unwrap())
        })
    });
}

// =============================================================================
// MEMO BENCHMARKS
// =============================================================================

fn bench_memo_cutoff(c: &mut Criterion) {
    let store = value_store();
    let root = store.create_state(0);
    let parity = store
        .create_computed(&[root], |inputs| inputs[0].rem_euclid(2))
        .unwrap();
    let mut last = parity;
    for _ in 0..100 {
        last = store.create_computed(&[last], |inputs| *inputs[0] * 3).unwrap();
    }
    store.read(last).unwrap();
    let mut next = 0;

    // Parity stays even, so the chain below it is skipped
    c.bench_function("memo_cutoff_chain_100", |b| {
        b.iter(|| {
            next += 2;
            store.write(root, next).unwrap();
            black_box(store.read(last).unwrap())
        })
    });
}

fn bench_read_clean(c: &mut Criterion) {
    let store = value_store();
    let s = store.create_state(42);
    let d = store.create_computed(&[s], |inputs| *inputs[0] * 2).unwrap();
    store.read(d).unwrap();

    c.bench_function("read_clean", |b| b.iter(|| black_box(store.read(d).unwrap())));
}

criterion_group!(
    benches,
    bench_state_write,
    bench_state_write_same_value,
    bench_chain_flush,
    bench_diamond_flush,
    bench_batched_writes,
    bench_memo_cutoff,
    bench_read_clean,
);
criterion_main!(benches);

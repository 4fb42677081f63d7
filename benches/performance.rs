//! Performance benchmarks for the instance store.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use instance_store::{InstanceKey, InstanceStore, StoreConfig};
use tempfile::TempDir;

fn create_store(dir: &TempDir, cache_size: usize) -> InstanceStore {
    InstanceStore::open(StoreConfig {
        cache_size,
        // Reclaim only when benchmarked explicitly
        max_free_count: 0,
        max_orphaned_bytes: 0,
        ..StoreConfig::new(dir.path().join("repository"), "bench")
    })
    .unwrap()
}

fn key(i: usize) -> InstanceKey {
    InstanceKey::new(format!("bench.id=\"{}\"", i))
}

fn instance(i: usize) -> Vec<u8> {
    (0..1400).map(|b| ((b + i) % 256) as u8).collect()
}

/// Benchmark appending new instances
fn bench_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir, 16);
    let bytes = instance(0);
    let mut next = 0;

    c.bench_function("instance_put_1400b", |b| {
        b.iter(|| {
            store.put(&key(next), &bytes).unwrap();
            next += 1;
        });
    });
}

/// Benchmark reads that miss the cache
fn bench_get_uncached(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_get_uncached");

    for count in [100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("instances", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir, 1);
            for i in 0..count {
                store.put(&key(i), &instance(i)).unwrap();
            }

            let mut i = 0;
            b.iter(|| {
                black_box(store.get(&key(i % count)).unwrap());
                i += 7;
            });
        });
    }

    group.finish();
}

/// Benchmark bulk enumeration
fn bench_get_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_get_all");

    for count in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("instances", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir, 1);
            for i in 0..count {
                store.put(&key(i), &instance(i)).unwrap();
            }

            b.iter(|| {
                black_box(store.get_all().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark compaction with half the instances removed
fn bench_reclaim(c: &mut Criterion) {
    let mut group = c.benchmark_group("reclaim_half_free");
    group.sample_size(20);

    for count in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("instances", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let store = create_store(&dir, 1);
                    for i in 0..count {
                        store.put(&key(i), &instance(i)).unwrap();
                    }
                    for i in (0..count).step_by(2) {
                        store.remove(&key(i)).unwrap();
                    }
                    (dir, store)
                },
                |(_dir, store)| {
                    black_box(store.reclaim().unwrap());
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_put,
    bench_get_uncached,
    bench_get_all,
    bench_reclaim,
);

criterion_main!(benches);


use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use partstore::telemetry::noop_event_listener;
use partstore::{CacheHintMode, MemPart, PartStore, PartWrapper, StorageConfig};
use tempfile::TempDir;

use std::sync::Arc;

fn make_config(root: &std::path::Path) -> StorageConfig {
    StorageConfig {
        root: root.to_path_buf(),
        cache_hint: CacheHintMode::Disabled,
        event_listener: noop_event_listener(),
        ..Default::default()
    }
}

fn bench_build_mem_part(c: &mut Criterion) {
    let es = datasets::generate_elements(datasets::DEFAULT_SEED, 20_000, 64, 16);
    let mut group = c.benchmark_group("build");

    group.bench_function("init_from_elements_20k", |b| {
        b.iter_batched(
            || es.clone(),
            |mut batch| {
                let mut mp = MemPart::new();
                mp.init_from_elements(black_box(&mut batch), 2 * 1024 * 1024)
                    .unwrap();
                mp
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut es = datasets::generate_elements(datasets::DEFAULT_SEED, 20_000, 64, 16);
    let mut mp = MemPart::new();
    mp.init_from_elements(&mut es, 2 * 1024 * 1024).unwrap();
    let mut group = c.benchmark_group("flush");

    group.bench_function("flush_20k", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().expect("tempdir");
                let store = PartStore::open(make_config(dir.path())).expect("store");
                (dir, store)
            },
            |(dir, store)| {
                let part = store.flush_mem_part(black_box(&mp)).unwrap();
                if let Some(p) = part {
                    p.release();
                }
                drop(store);
                dir
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let store = PartStore::open(make_config(dir.path())).expect("store");
    let parts: Vec<Arc<PartWrapper>> = (0..8)
        .map(|i| {
            let mut es =
                datasets::generate_elements(datasets::DEFAULT_SEED + i, 5_000, 32, 16);
            let mp = store.build_mem_part(&mut es).unwrap();
            let part = store.flush_mem_part(&mp).unwrap().expect("non-empty part");
            store.recycle_mem_part(mp);
            part
        })
        .collect();

    let mut group = c.benchmark_group("merge");

    group.bench_function("merge_8x5k_descriptors", |b| {
        b.iter(|| {
            let mut reader = store.merge_reader(&parts).unwrap();
            let mut blocks = 0u64;
            while reader.next_block().unwrap().is_some() {
                blocks += 1;
            }
            black_box(blocks)
        })
    });

    group.bench_function("merge_8x5k_load", |b| {
        b.iter(|| {
            let mut reader = store.merge_reader(&parts).unwrap();
            let mut rows = 0usize;
            while reader.next_block().unwrap().is_some() {
                rows += reader.load_block_data().unwrap().len();
            }
            black_box(rows)
        })
    });

    group.bench_function("merge_parts_8x5k", |b| {
        b.iter(|| {
            let mp = store.merge_parts(black_box(&parts)).unwrap();
            store.recycle_mem_part(mp);
        })
    });

    group.finish();
    for p in parts {
        p.release();
    }
}

criterion_group!(benches, bench_build_mem_part, bench_flush, bench_merge);
criterion_main!(benches);

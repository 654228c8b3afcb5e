use std::sync::Arc;

use chrono::Duration;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use metercache::{ArgSet, CacheStore, Fingerprint, SystemClock};
use meterstoredb::LogStore;
use tempfile::TempDir;

fn bench_cached_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_get");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_1kb_cached", |b| {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LogStore::open(dir.path()).unwrap());
        let cache = CacheStore::new(store, Arc::new(SystemClock));
        let data = vec![b'x'; 1024];

        let fingerprints: Vec<_> = (0..100)
            .map(|i| {
                let fp = Fingerprint::compute("search", &ArgSet::new().with("page", i));
                cache.put(&fp, &data, Duration::hours(1)).unwrap();
                fp
            })
            .collect();

        let mut counter = 0;
        b.iter(|| {
            black_box(cache.get(&fingerprints[counter % 100]).unwrap());
            counter += 1;
        });
    });

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    group.throughput(Throughput::Elements(1));

    group.bench_function("search_args", |b| {
        let args = ArgSet::new()
            .with("location", "  Rome ")
            .with("term", "pizza")
            .with("radius", 1500.0)
            .with("categories", vec!["food", "italian"]);
        b.iter(|| black_box(Fingerprint::compute("search", black_box(&args))));
    });

    group.finish();
}

criterion_group!(benches, bench_cached_get, bench_fingerprint);
criterion_main!(benches);

use chrono::Duration;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hems_storage::{
    Backend, FieldRecord, NamespaceProvider, RecordStore, SqliteBackend, StoreSettings, Timestamp,
    Window,
};
use std::sync::Arc;
use tempfile::tempdir;

struct Meter;

impl NamespaceProvider for Meter {
    fn namespace_id(&self) -> String {
        "meter".to_string()
    }
}

fn series(start: Timestamp, count: i64) -> Vec<FieldRecord> {
    (0..count)
        .map(|k| FieldRecord::new(start + Duration::minutes(k)).with_field("wh", k as f64))
        .collect()
}

fn bench_insert_and_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_and_save");
    let start = Timestamp::parse("2024-06-01T00:00:00Z").unwrap();

    for level in [0u32, 6].iter() {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::new("gzip", level), level, |b, &level| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                let backend: Arc<dyn Backend> =
                    Arc::new(SqliteBackend::open(&dir.path().join("bench.sqlite3")).unwrap());
                let settings = StoreSettings {
                    compression_level: level,
                    ..StoreSettings::default()
                };
                let mut store: RecordStore<FieldRecord> =
                    RecordStore::open(&Meter, Some(backend), settings).unwrap();
                for record in series(start, 10_000) {
                    store.insert(black_box(record)).unwrap();
                }
                store.save().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_nearest_lookup(c: &mut Criterion) {
    let start = Timestamp::parse("2024-06-01T00:00:00Z").unwrap();
    let mut store: RecordStore<FieldRecord> = RecordStore::in_memory(&Meter).unwrap();
    for record in series(start, 50_000) {
        store.insert(record).unwrap();
    }
    let target = start + Duration::seconds(25_000 * 60 + 17);

    c.bench_function("nearest_lookup", |b| {
        b.iter(|| {
            store
                .get(black_box(target), Window::Span(Duration::minutes(5)))
                .unwrap()
                .is_some()
        });
    });
}

fn bench_compaction(c: &mut Criterion) {
    let now = Timestamp::parse("2024-06-20T12:00:00Z").unwrap();

    c.bench_function("compact_three_days", |b| {
        b.iter(|| {
            let mut store: RecordStore<FieldRecord> = RecordStore::in_memory(&Meter).unwrap();
            for record in series(now - Duration::days(3), 3 * 24 * 60) {
                store.insert(record).unwrap();
            }
            store.compact_at(black_box(now)).unwrap()
        });
    });
}

criterion_group!(benches, bench_insert_and_save, bench_nearest_lookup, bench_compaction);
criterion_main!(benches);

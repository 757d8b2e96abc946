use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map, Value as Json};
use tempfile::TempDir;

use walstore::{DatedStorage, StorageDate, WalConfig};

fn payload(n: u64) -> Map<String, Json> {
    json!({
        "progress": n,
        "status": "running",
        "metadata": {"source": "bench"},
    })
    .as_object()
    .cloned()
    .expect("payload")
}

fn bench_config(base: &TempDir) -> WalConfig {
    WalConfig {
        base_dir: base.path().to_string_lossy().into_owned(),
        duckdb_flush_interval_seconds: 3600,
        batch_size: 1_000_000,
        ..WalConfig::default()
    }
}

fn bench_store(c: &mut Criterion) {
    c.bench_function("store_fsync_500", |b| {
        b.iter_batched(
            || {
                let tmp = TempDir::new().expect("tmp");
                let storage = DatedStorage::open(
                    StorageDate::parse("2025-01-15").expect("date"),
                    "data.duckdb",
                    bench_config(&tmp),
                )
                .expect("open");
                (tmp, storage)
            },
            |(_tmp, storage)| {
                for n in 0..500u64 {
                    storage
                        .store(&format!("k{}", n % 16), payload(n), Some("w1"), None, None)
                        .expect("store");
                }
                storage.close().expect("close");
            },
            criterion::BatchSize::PerIteration,
        );
    });
}

fn bench_reads(c: &mut Criterion) {
    let tmp = TempDir::new().expect("tmp");
    let storage = DatedStorage::open(
        StorageDate::parse("2025-01-15").expect("date"),
        "data.duckdb",
        bench_config(&tmp),
    )
    .expect("open");
    for n in 0..10_000u64 {
        storage
            .store(
                &format!("k{}", n % 256),
                payload(n),
                Some(&format!("w{}", n % 8)),
                None,
                None,
            )
            .expect("store");
    }

    c.bench_function("get_key_process_hot", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n = n.wrapping_add(1);
            storage.get_key_process(&format!("k{}", n % 256), Some(&format!("w{}", n % 8)))
        });
    });

    storage.close().expect("close");
}

criterion_group!(benches, bench_store, bench_reads);
criterion_main!(benches);

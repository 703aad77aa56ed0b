//! Benchmarks for the burrow hot path.
//!
//! Run with: cargo bench --package burrow
//!
//! ## Benchmark Categories
//!
//! - **Put**: streaming writes through the temp-file + rename pipeline
//! - **Get**: cache-backed positional reads
//! - **Middleware**: the same round-trip through a compression chain

use burrow::mw::{Gzip, Middleware};
use burrow::{Db, Options};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), Options::default()).unwrap();
        let bucket = db.create_bucket(&["bench"]).unwrap();
        let data = payload(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| bucket.put("value", black_box(&data[..]), &[]).unwrap())
        });
        db.close().unwrap();
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), Options::default()).unwrap();
        let bucket = db.create_bucket(&["bench"]).unwrap();
        bucket.put("value", &payload(size)[..], &[]).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut buf = Vec::with_capacity(size);
            b.iter(|| {
                buf.clear();
                let mut value = bucket.get("value", &[]).unwrap();
                value.read_to_end(&mut buf).unwrap();
                black_box(buf.len())
            })
        });
        db.close().unwrap();
    }
    group.finish();
}

fn bench_gzip_roundtrip(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), Options::default()).unwrap();
    let bucket = db.create_bucket(&["bench"]).unwrap();
    let data = payload(64 * 1024);
    let mws: Vec<Arc<dyn Middleware>> = vec![Arc::new(Gzip::new(6))];

    c.bench_function("gzip_roundtrip_64k", |b| {
        let mut buf = Vec::with_capacity(data.len());
        b.iter(|| {
            bucket.put("value", &data[..], &mws).unwrap();
            buf.clear();
            let mut value = bucket.get("value", &mws).unwrap();
            value.read_to_end(&mut buf).unwrap();
            black_box(buf.len())
        })
    });
    db.close().unwrap();
}

criterion_group!(benches, bench_put, bench_get, bench_gzip_roundtrip);
criterion_main!(benches);

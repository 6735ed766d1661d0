//! Benchmarks for the source runtime.
//!
//! Run with: cargo bench

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use livesource_rs::prelude::*;
use livesource_rs::sandbox::{SandboxModule, SandboxSource};
use livesource_rs::source::format::{parse_csv, parse_json_rows, parse_lines};
use serde_json::json;
use tokio::runtime::Runtime;

fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            json!({"id": i, "title": format!("item {i}"), "done": i % 2 == 0})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

fn json_document(n: usize) -> String {
    serde_json::to_string(&rows(n)).unwrap()
}

fn csv_document(n: usize) -> String {
    let mut text = String::from("id,title,note\n");
    for i in 0..n {
        text.push_str(&format!("{i},item {i},\"quoted, with comma\"\n"));
    }
    text
}

/// Cache hits and stores under contention-free conditions.
fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    let cache = MemoryCache::new();
    cache.set("hot", rows(100), Duration::from_secs(600));

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box("hot"))));
    });
    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(cache.get(black_box("cold"))));
    });

    let shared = Arc::new(rows(100));
    group.bench_function("set_with_stale", |b| {
        b.iter(|| {
            cache.set_with_stale(
                "swr",
                Arc::clone(&shared),
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
        });
    });

    group.finish();
}

/// Output parsing across document sizes.
fn bench_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for size in [10, 100, 1000] {
        let json = json_document(size);
        group.throughput(Throughput::Bytes(json.len() as u64));
        group.bench_with_input(BenchmarkId::new("json", size), &json, |b, text| {
            b.iter(|| black_box(parse_json_rows("bench", text).unwrap()));
        });

        let ndjson = rows(size)
            .iter()
            .map(|row| serde_json::to_string(row).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        group.throughput(Throughput::Bytes(ndjson.len() as u64));
        group.bench_with_input(BenchmarkId::new("ndjson", size), &ndjson, |b, text| {
            b.iter(|| black_box(parse_json_rows("bench", text).unwrap()));
        });

        let csv = csv_document(size);
        group.throughput(Throughput::Bytes(csv.len() as u64));
        group.bench_with_input(BenchmarkId::new("csv", size), &csv, |b, text| {
            b.iter(|| black_box(parse_csv("bench", text, b',', true).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("lines", size), &csv, |b, text| {
            b.iter(|| black_box(parse_lines(text)));
        });
    }

    group.finish();
}

const ROWS_MODULE: &str = r#"
(module
  (memory (export "memory") 1)
  (data (i32.const 64) "[{\"i\":0},{\"i\":1},{\"i\":2}]")
  (func (export "fetch") (result i32) i32.const 64)
  (func (export "result_length") (result i32) i32.const 25))
"#;

/// Module instantiation and calls through the shared engine.
fn bench_sandbox(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = SandboxConfig::default();
    let env = BTreeMap::new();

    let mut group = c.benchmark_group("sandbox");
    group.sample_size(20);

    group.bench_function("instantiate", |b| {
        b.iter(|| black_box(SandboxModule::from_bytes("bench", ROWS_MODULE, &config, &env).unwrap()));
    });

    let mut module = SandboxModule::from_bytes("bench", ROWS_MODULE, &config, &env).unwrap();
    group.bench_function("raw_fetch", |b| {
        b.iter(|| black_box(module.fetch().unwrap()));
    });

    let source = Arc::new(SandboxSource::from_module(
        SandboxModule::from_bytes("bench", ROWS_MODULE, &config, &env).unwrap(),
        None,
    ));
    for concurrency in [1, 4, 8] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("source_fetch", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.iter(|| {
                    rt.block_on(async {
                        let handles: Vec<_> = (0..concurrency)
                            .map(|_| {
                                let source = Arc::clone(&source);
                                tokio::spawn(async move { source.fetch().await.unwrap() })
                            })
                            .collect();
                        for handle in handles {
                            black_box(handle.await.unwrap());
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

/// Resolver fetches served from the cache.
fn bench_resolver(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("items.json"), json_document(500)).unwrap();

    let config = SourceConfig::builder(SourceKind::Json)
        .path("items.json")
        .cache(Duration::from_secs(600), CacheStrategy::StaleWhileRevalidate)
        .build();
    let options = RuntimeOptions::default().base_dir(dir.path());
    let resolver = rt
        .block_on(async { Resolver::from_configs([("items", config)], &options) })
        .unwrap();
    rt.block_on(resolver.fetch("items")).unwrap();

    let mut group = c.benchmark_group("resolver");
    group.bench_function("cached_fetch", |b| {
        b.iter(|| black_box(rt.block_on(resolver.fetch("items")).unwrap()));
    });
    group.bench_function("run_uncached", |b| {
        b.iter(|| black_box(rt.block_on(resolver.run("items")).unwrap()));
    });
    group.finish();

    rt.block_on(resolver.close()).unwrap();
}

criterion_group!(benches, bench_cache, bench_parsing, bench_sandbox, bench_resolver);

criterion_main!(benches);

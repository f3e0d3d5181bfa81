//! Benchmarks for cache key rendering and archive hashing.

use ciflow::cache::{content_hash, render_key};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;

fn cache_key_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("temp dir");
    fs::write(dir.path().join("Cargo.lock"), "x".repeat(64 * 1024)).expect("lock file");
    fs::write(dir.path().join("blob"), vec![7u8; 4 * 1024 * 1024]).expect("blob");

    c.bench_function("render_plain_key", |b| {
        b.iter(|| render_key(black_box("cargo-registry-v1"), dir.path()))
    });

    c.bench_function("render_checksum_key", |b| {
        b.iter(|| {
            render_key(
                black_box(r#"cargo-{{ os }}-{{ arch }}-{{ checksum "Cargo.lock" }}"#),
                dir.path(),
            )
        })
    });

    c.bench_function("content_hash_4mb", |b| {
        b.iter(|| content_hash(black_box(&dir.path().join("blob"))))
    });
}

criterion_group!(benches, cache_key_benchmark);
criterion_main!(benches);

//! Performance benchmarks for request handling.
//!
//! These benchmarks measure the per-request hot paths in the daemon:
//! - Request line parsing
//! - Path confinement against a real directory tree

use std::fs;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use daemon::files::PathGuard;
use protocol::{AuthRequest, Command};
use tempfile::TempDir;

/// Benchmark parsing of authentication and command lines.
fn bench_request_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_parsing");

    group.bench_function("auth_login", |b| {
        b.iter(|| AuthRequest::parse(black_box("login alice correct-horse")))
    });

    group.bench_function("command_pwd", |b| {
        b.iter(|| Command::parse(black_box("pwd")))
    });

    group.bench_function("command_copy", |b| {
        b.iter(|| Command::parse(black_box("COPY reports/2024/q1.csv archive/reports")))
    });

    group.bench_function("command_unknown", |b| {
        b.iter(|| Command::parse(black_box("frobnicate a b c")))
    });

    group.finish();
}

/// Benchmark path resolution for existing, new and escaping paths.
fn bench_path_resolution(c: &mut Criterion) {
    let temp_dir = TempDir::new().expect("temp dir");
    let root = temp_dir.path().join("alice").join("docs");
    fs::create_dir_all(root.join("a/b/c/d")).expect("create tree");
    fs::write(root.join("a/b/c/d/file.txt"), b"x").expect("write file");
    let guard = PathGuard::new(&root).expect("guard");

    let mut group = c.benchmark_group("path_resolution");

    group.bench_function("existing_deep", |b| {
        b.iter(|| guard.resolve(black_box("a/b/c/d/file.txt")))
    });

    group.bench_function("new_file", |b| {
        b.iter(|| guard.resolve(black_box("a/b/new/upload.bin")))
    });

    group.bench_function("traversal_rejected", |b| {
        b.iter(|| guard.resolve(black_box("a/../../../../etc/passwd")))
    });

    group.finish();
}

criterion_group!(benches, bench_request_parsing, bench_path_resolution);
criterion_main!(benches);

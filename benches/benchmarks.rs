//! Benchmark suite for the healer's hot paths.
//!
//! Every tailed line goes through the classifier, and every analyzed error
//! through normalization and hashing, so these two dominate per-line cost.
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ralph_healer::{hash_error, normalize_error, PatternClassifier};

/// Representative loop output: mostly noise, some failures.
const LINES: &[&str] = &[
    "INFO: Starting iteration 14",
    "INFO: Task completed successfully",
    "ERROR: PRD file not found: .specs/tasks/TASK-001.md",
    "Error: Rate limit exceeded (429 Too Many Requests)",
    "Error: CLAUDE_API_KEY is required",
    "Compiling ralph v0.1.0 (/home/dev/ralph)",
    "ETIMEDOUT while fetching https://api.example.com/v1/tasks",
    "FATAL: worker crashed at 2024-01-01 10:00:00 in /srv/app/main.js",
    "No pending tasks remaining",
    "warning: unused variable `x`",
];

// ============================================================================
// Classification
// ============================================================================

fn bench_classify(c: &mut Criterion) {
    let classifier = PatternClassifier::new();
    let mut group = c.benchmark_group("classify");

    for line in LINES.iter().take(4) {
        group.bench_with_input(BenchmarkId::from_parameter(&line[..20.min(line.len())]), line, |b, line| {
            b.iter(|| classifier.classify(black_box(line)));
        });
    }

    group.throughput(Throughput::Elements(LINES.len() as u64));
    group.bench_function("mixed_batch", |b| {
        b.iter(|| {
            LINES
                .iter()
                .filter(|line| {
                    classifier.classify(black_box(line)).is_some()
                        || classifier.is_unknown_error_candidate(black_box(line))
                })
                .count()
        });
    });

    group.finish();
}

// ============================================================================
// Hashing
// ============================================================================

fn bench_hash_error(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_error");

    for size in [80, 500, 4000] {
        let message: String = LINES.iter().cycle().flat_map(|l| l.chars().chain(['\n'])).take(size).collect();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("normalize", size), &message, |b, m| {
            b.iter(|| normalize_error(black_box(m)));
        });
        group.bench_with_input(BenchmarkId::new("hash", size), &message, |b, m| {
            b.iter(|| hash_error(black_box(m)));
        });
    }

    group.finish();
}

criterion_group!(classify_benches, bench_classify);
criterion_group!(hash_benches, bench_hash_error);
criterion_main!(classify_benches, hash_benches);

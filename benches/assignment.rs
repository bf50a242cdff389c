//! Assignment benchmarks
//!
//! Hashing must stay cheap: it runs on every first request of a visitor.
//!
//! Toyota Way: Genchi Genbutsu (measure, don't guess)
//!
//! Run with: cargo bench --bench assignment

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trueno_ab::assignment::{bucket, hash_assign, AssignmentEngine, MemoryAssignmentStore};
use trueno_ab::experiment::{ExperimentRecord, ExperimentRegistry, ExperimentStatus, VariantRecord};

fn experiment(arms: usize) -> ExperimentRecord {
    #[allow(clippy::cast_precision_loss)]
    let weight = 1.0 / arms as f64;
    let mut builder = ExperimentRecord::builder("bench", "Assignment bench")
        .variant(VariantRecord::control("v0", "control", weight));
    for i in 1..arms {
        builder = builder.variant(VariantRecord::new(format!("v{i}"), "treatment", weight));
    }
    builder.build()
}

/// Benchmark the raw bucket hash
fn bench_bucket(c: &mut Criterion) {
    c.bench_function("bucket", |b| {
        b.iter(|| bucket(black_box("bench"), black_box(0), black_box("visitor-123456")));
    });
}

/// Benchmark weighted selection for growing variant counts
fn bench_hash_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_assign");
    for arms in [2, 5, 10] {
        let exp = experiment(arms);
        group.bench_with_input(BenchmarkId::from_parameter(arms), &exp, |b, exp| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                hash_assign(black_box(exp), &format!("visitor-{i}")).map(VariantRecord::weight)
            });
        });
    }
    group.finish();
}

/// Benchmark sticky assignment through the in-memory store
fn bench_sticky_assign(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(ExperimentRegistry::new());
    registry.create(experiment(2)).unwrap();
    registry.transition("bench", ExperimentStatus::Active, None).unwrap();
    let engine = AssignmentEngine::new(registry, Arc::new(MemoryAssignmentStore::new()));

    let mut group = c.benchmark_group("sticky_assign");
    group.bench_function("first_request", |b| {
        let mut i = 0u64;
        b.to_async(&runtime).iter(|| {
            i += 1;
            let visitor = format!("new-{i}");
            let engine = &engine;
            async move { engine.assign("bench", &visitor).await.unwrap() }
        });
    });
    group.bench_function("repeat_request", |b| {
        b.to_async(&runtime)
            .iter(|| async { engine.assign("bench", black_box("returning")).await.unwrap() });
    });
    group.finish();
}

criterion_group!(benches, bench_bucket, bench_hash_assign, bench_sticky_assign);
criterion_main!(benches);

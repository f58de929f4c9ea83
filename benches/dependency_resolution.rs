use conductor::domain::models::{Dependency, StepInstance, StepStatus, WorkerType};
use conductor::services::DependencyResolver;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use uuid::Uuid;

/// A run where step N depends on every earlier step, half of them completed.
fn fan_in_run(size: u32) -> Vec<StepInstance> {
    let run_id = Uuid::new_v4();
    (1..=size)
        .map(|sequence| {
            let deps = (1..sequence).map(Dependency::sequential).collect();
            let mut step = StepInstance::new(run_id, "bench", sequence, format!("s{sequence}"), WorkerType::System, deps);
            if sequence <= size / 2 {
                step.status = StepStatus::Completed;
            }
            step
        })
        .collect()
}

/// A linear chain where step N depends on N-1.
fn chain_run(size: u32) -> Vec<StepInstance> {
    let run_id = Uuid::new_v4();
    (1..=size)
        .map(|sequence| {
            let deps = if sequence > 1 { vec![Dependency::sequential(sequence - 1)] } else { vec![] };
            let mut step = StepInstance::new(run_id, "bench", sequence, format!("s{sequence}"), WorkerType::System, deps);
            if sequence < size {
                step.status = StepStatus::Completed;
            }
            step
        })
        .collect()
}

fn bench_readiness_scan(c: &mut Criterion) {
    let resolver = DependencyResolver::new();
    let mut group = c.benchmark_group("readiness_scan");
    for size in [10u32, 50, 200] {
        let fan_in = fan_in_run(size);
        group.bench_with_input(BenchmarkId::new("fan_in", size), &fan_in, |b, steps| {
            b.iter(|| steps.iter().filter(|s| resolver.is_ready(black_box(s), steps)).count());
        });

        let chain = chain_run(size);
        group.bench_with_input(BenchmarkId::new("chain", size), &chain, |b, steps| {
            b.iter(|| steps.iter().filter(|s| resolver.is_ready(black_box(s), steps)).count());
        });
    }
    group.finish();
}

fn bench_blocking_scan(c: &mut Criterion) {
    let resolver = DependencyResolver::new();
    let mut steps = fan_in_run(100);
    steps[0].status = StepStatus::Failed;

    c.bench_function("blocking_dependencies/fan_in_100", |b| {
        b.iter(|| {
            steps
                .iter()
                .map(|s| resolver.blocking_dependencies(black_box(s), &steps).len())
                .sum::<usize>()
        });
    });
}

criterion_group!(benches, bench_readiness_scan, bench_blocking_scan);
criterion_main!(benches);

//! Run-loop benchmarks using criterion.
//!
//! Benchmarks for bind-chain interpretation, map fusion, memoized reads,
//! and batched stream traversal.
//!
//! Run with: cargo bench --bench run_loop_bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use monix::{Iterant, Task, TrampolineScheduler};

fn run_now<A: Send + 'static>(task: &Task<A>) -> A {
    task.run(Arc::new(TrampolineScheduler::default()))
        .try_take()
        .expect("task did not complete synchronously")
        .expect("task failed")
}

/// Benchmark deep flat_map chains through the trampoline.
fn bench_bind_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_chain");
    for depth in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let mut task = Task::pure(0u64);
                for _ in 0..depth {
                    task = task.flat_map(|x| Task::pure(x + 1));
                }
                black_box(run_now(&task))
            });
        });
    }
    group.finish();
}

/// Benchmark fused versus chained map frames.
fn bench_map_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_chain");
    group.bench_function("map_x64", |b| {
        b.iter(|| {
            let mut task = Task::pure(1u64);
            for _ in 0..64 {
                task = task.map(|x| x + 1);
            }
            black_box(run_now(&task))
        });
    });
    group.finish();
}

/// Benchmark the memoized hot path.
fn bench_memoize_read(c: &mut Criterion) {
    let task = Task::eval(|| 42u64).memoize();
    // Prime the cell so the benchmark measures the Done fast path.
    let _ = run_now(&task);

    c.bench_function("memoize_hot_read", |b| {
        b.iter(|| black_box(run_now(&task)));
    });
}

/// Benchmark batched stream traversal.
fn bench_iterant_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterant_fold");
    for size in [100usize, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let items: Vec<u64> = (0..size as u64).collect();
            b.iter(|| {
                let stream = Iterant::from_vec(items.clone());
                black_box(run_now(&stream.fold_left(0u64, |acc, x| acc + x)))
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_bind_chain,
    bench_map_chain,
    bench_memoize_read,
    bench_iterant_fold
);
criterion_main!(benches);

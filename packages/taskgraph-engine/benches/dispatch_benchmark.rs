//! Benchmark for dispatch-loop throughput
//!
//! Measures:
//! - Wide fan-out graphs (many independent chains sharing one worker pool)
//! - Scaling with worker count
//! - Chain depth vs. fan-out width

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use taskgraph_engine::mock::MockWorkerPool;
use taskgraph_engine::thunk::{TaskValue, Thunk, ThunkFn, ThunkInput};
use taskgraph_engine::{Context, EngineConfig, WorkerId, WorkerPool};

/// Builds `width` independent chains of `depth` thunks each, all rooted
/// under one synthetic join thunk, and returns the join's id.
fn build_fan_out(ctx: &Context, width: usize, depth: usize) -> taskgraph_engine::ThunkId {
    let mut heads = Vec::with_capacity(width);
    for _ in 0..width {
        let leaf_fn: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(1i64)));
        let mut current = ctx.register(Thunk::new(leaf_fn, vec![]).with_get_result(true));
        for _ in 1..depth {
            let step_fn: ThunkFn = Arc::new(|inputs: &[TaskValue]| {
                let v = *inputs[0].downcast_ref::<i64>().unwrap();
                Ok(TaskValue::data(v + 1))
            });
            current = ctx.register(
                Thunk::new(step_fn, vec![ThunkInput::Thunk(current)]).with_get_result(true),
            );
        }
        heads.push(current);
    }

    let join_fn: ThunkFn = Arc::new(|inputs: &[TaskValue]| {
        let sum: i64 = inputs.iter().map(|v| *v.downcast_ref::<i64>().unwrap()).sum();
        Ok(TaskValue::data(sum))
    });
    let join_inputs = heads.into_iter().map(ThunkInput::Thunk).collect();
    ctx.register(Thunk::new(join_fn, join_inputs).with_get_result(true))
}

fn bench_fan_out_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out_width");

    for width in [8, 32, 128].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(width), width, |b, &width| {
            b.iter(|| {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let workers: Vec<WorkerId> = (0..4).map(|i| WorkerId(format!("w{i}"))).collect();
                    let pool: Arc<dyn WorkerPool> = Arc::new(MockWorkerPool::new(workers.clone()));
                    let ctx = Context::new(workers, EngineConfig::default());
                    let root = build_fan_out(&ctx, width, 3);
                    let result = taskgraph_engine::scheduler::run(&ctx, pool, root)
                        .await
                        .expect("fan-out run failed");
                    black_box(result);
                });
            });
        });
    }

    group.finish();
}

fn bench_worker_count_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_count_scaling");

    for num_workers in [1, 2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_workers),
            num_workers,
            |b, &num_workers| {
                b.iter(|| {
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(async {
                        let workers: Vec<WorkerId> =
                            (0..num_workers).map(|i| WorkerId(format!("w{i}"))).collect();
                        let pool: Arc<dyn WorkerPool> = Arc::new(MockWorkerPool::new(workers.clone()));
                        let ctx = Context::new(workers, EngineConfig::default());
                        let root = build_fan_out(&ctx, 32, 3);
                        let result = taskgraph_engine::scheduler::run(&ctx, pool, root)
                            .await
                            .expect("fan-out run failed");
                        black_box(result);
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_chain_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_depth");

    for depth in [4, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(depth), depth, |b, &depth| {
            b.iter(|| {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let workers: Vec<WorkerId> = (0..4).map(|i| WorkerId(format!("w{i}"))).collect();
                    let pool: Arc<dyn WorkerPool> = Arc::new(MockWorkerPool::new(workers.clone()));
                    let ctx = Context::new(workers, EngineConfig::default());
                    let root = build_fan_out(&ctx, 4, depth);
                    let result = taskgraph_engine::scheduler::run(&ctx, pool, root)
                        .await
                        .expect("chain run failed");
                    black_box(result);
                });
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fan_out_width,
    bench_worker_count_scaling,
    bench_chain_depth
);
criterion_main!(benches);

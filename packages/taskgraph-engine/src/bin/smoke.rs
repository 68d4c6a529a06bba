//! Local harness: builds an in-process mock worker pool, runs the
//! diamond-graph scenario (`A` shared by `B` and `C`, `D = h(B, C)`), and
//! prints the dispatch trace. Not a production worker-RPC server — that
//! transport is explicitly out of scope — just a runnable end-to-end
//! exercise the way the teacher workspace ships runnable pieces alongside
//! its library.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use taskgraph_engine::mock::MockWorkerPool;
use taskgraph_engine::stager::{cached_stage, Staged};
use taskgraph_engine::thunk::{TaskValue, Thunk, ThunkFn, ThunkInput};
use taskgraph_engine::worker::WorkerPool;
use taskgraph_engine::{Computation, Context, Engine, EngineConfig, LeafStage, Result, ThunkId, WorkerId};
use tracing_subscriber::EnvFilter;

fn staged_to_input(staged: Staged) -> ThunkInput {
    match staged {
        Staged::Thunk(id) => ThunkInput::Thunk(id),
        Staged::Chunk(c) => ThunkInput::Value(TaskValue::Chunk(c)),
    }
}

/// A leaf wrapping a plain closure with no dependencies — stands in for a
/// source value a real caller would build from a `LeafStage` of their own.
struct ConstLeaf(i64, Arc<AtomicUsize>);

impl LeafStage for ConstLeaf {
    fn stage(&self, ctx: &Context) -> Result<ThunkId> {
        let v = self.0;
        let counter = self.1.clone();
        let f: ThunkFn = Arc::new(move |_: &[TaskValue]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskValue::data(v))
        });
        Ok(ctx.register(Thunk::new(f, vec![]).with_get_result(true)))
    }
}

/// A leaf computing `f(inner)`, staging `inner` through the Context's
/// memoization cache so a leaf referenced from two places (`B` and `C` both
/// depend on `A`) stages to one shared Thunk.
struct UnaryLeaf<F> {
    inner: Computation,
    f: F,
}

impl<F> LeafStage for UnaryLeaf<F>
where
    F: Fn(i64) -> i64 + Send + Sync + Clone + 'static,
{
    fn stage(&self, ctx: &Context) -> Result<ThunkId> {
        let input = staged_to_input(cached_stage(ctx, &self.inner)?);
        let f = self.f.clone();
        let thunk_fn: ThunkFn = Arc::new(move |inputs: &[TaskValue]| {
            let v = *inputs[0].downcast_ref::<i64>().unwrap();
            Ok(TaskValue::data(f(v)))
        });
        Ok(ctx.register(Thunk::new(thunk_fn, vec![input]).with_get_result(true)))
    }
}

struct BinaryLeaf<F> {
    left: Computation,
    right: Computation,
    f: F,
}

impl<F> LeafStage for BinaryLeaf<F>
where
    F: Fn(i64, i64) -> i64 + Send + Sync + Clone + 'static,
{
    fn stage(&self, ctx: &Context) -> Result<ThunkId> {
        let left = staged_to_input(cached_stage(ctx, &self.left)?);
        let right = staged_to_input(cached_stage(ctx, &self.right)?);
        let f = self.f.clone();
        let thunk_fn: ThunkFn = Arc::new(move |inputs: &[TaskValue]| {
            let l = *inputs[0].downcast_ref::<i64>().unwrap();
            let r = *inputs[1].downcast_ref::<i64>().unwrap();
            Ok(TaskValue::data(f(l, r)))
        });
        Ok(ctx.register(Thunk::new(thunk_fn, vec![left, right]).with_get_result(true)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool: Arc<dyn WorkerPool> =
        Arc::new(MockWorkerPool::new(vec![WorkerId("w1".into()), WorkerId("w2".into())]));
    let engine = Engine::new(pool, EngineConfig::default());

    let a_invocations = Arc::new(AtomicUsize::new(0));
    let a = Computation::leaf(ConstLeaf(1, a_invocations.clone()));
    let b = Computation::leaf(UnaryLeaf {
        inner: a.clone(),
        f: |v: i64| v + 10,
    });
    let c = Computation::leaf(UnaryLeaf {
        inner: a,
        f: |v: i64| v * 10,
    });
    let d = Computation::leaf(BinaryLeaf {
        left: b,
        right: c,
        f: |l: i64, r: i64| l + r,
    });

    let computed = engine.compute(&d).await?;
    let gathered = engine.gather_computed(&computed).await?;
    let result = *gathered.downcast_ref::<i64>().unwrap();

    println!("diamond graph result: {result}");
    println!(
        "leaf A invoked {} time(s) (expected 1 — memoization holds)",
        a_invocations.load(Ordering::SeqCst)
    );
    println!("thunk count in context: {}", engine.context().thunk_count());

    Ok(())
}

//! The Master API (§6): the surface a caller drives a `Computation` through.
//! Grounded on the teacher's `PipelineOrchestrator` (orchestrator.rs) — an
//! owning struct bundling the pieces a caller shouldn't have to re-thread
//! through every call. Ruby's `compute(c)`/`compute(ctx, c)` default-argument
//! pair becomes, in Rust, an owning `Engine` with a `compute` method plus an
//! explicit-Context escape hatch (`compute_in`) rather than an optional
//! parameter.

use crate::chunk::{AbstractChunk, CatCell};
use crate::computation::Computation;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lifetime::{self, FinalizerQueue};
use crate::scheduler;
use crate::stager::{self, Context, Staged};
use crate::thunk::TaskValue;
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// A materialized result of `compute` (§3 "Computed"): wraps the computed
/// value and, on drop, schedules a non-blocking forced free of any chunk it
/// owns. A destructor cannot safely block (§3 Lifetimes / §9 "Finalizer
/// yielding"), so the actual free is handed to `FinalizerQueue` rather than
/// awaited here.
pub struct Computed {
    value: Option<TaskValue>,
    finalizers: FinalizerQueue,
}

impl Computed {
    fn new(value: TaskValue, finalizers: FinalizerQueue) -> Self {
        Self {
            value: Some(value),
            finalizers,
        }
    }

    pub fn value(&self) -> &TaskValue {
        self.value.as_ref().expect("Computed value already taken")
    }

    /// Consumes the handle without scheduling a free — for a caller that is
    /// handing the chunk off to live on past this `Computed`'s scope (e.g.
    /// feeding it back in as a `Computation::Computed` leaf).
    pub fn into_value(mut self) -> TaskValue {
        self.value.take().expect("Computed value already taken")
    }
}

impl Drop for Computed {
    fn drop(&mut self) {
        if let Some(TaskValue::Chunk(chunk)) = &self.value {
            self.finalizers.enqueue_free_chunk(chunk);
        }
    }
}

/// Owns a `Context` and a `WorkerPool` and provides `compute`/`gather`/
/// `free`/`debug_compute` (§6). One `Engine` per logical run; cheap to
/// construct, since staging memoization lives in the `Context` it owns.
pub struct Engine {
    ctx: Context,
    pool: Arc<dyn WorkerPool>,
    finalizers: FinalizerQueue,
}

impl Engine {
    pub fn new(pool: Arc<dyn WorkerPool>, config: EngineConfig) -> Self {
        let workers = pool.workers();
        let finalizers = FinalizerQueue::spawn(pool.clone(), config.completion_channel_capacity);
        Self {
            ctx: Context::new(workers, config),
            pool,
            finalizers,
        }
    }

    pub fn with_default_config(pool: Arc<dyn WorkerPool>) -> Self {
        Self::new(pool, EngineConfig::default())
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// `compute(ctx, c) -> Computed` (§6), staging against this engine's own
    /// `Context`.
    pub async fn compute(&self, c: &Computation) -> Result<Computed> {
        self.compute_in(&self.ctx, c).await
    }

    /// The explicit-`Context` form, for a caller staging against a `Context`
    /// other than this engine's own (a scoped sub-DAG with its own
    /// memoization cache, for instance).
    pub async fn compute_in(&self, ctx: &Context, c: &Computation) -> Result<Computed> {
        let staged = stager::cached_stage(ctx, c)?;
        let value = self.run_staged(ctx, staged).await?;
        Ok(Computed::new(value, self.finalizers.clone()))
    }

    async fn run_staged(&self, ctx: &Context, staged: Staged) -> Result<TaskValue> {
        match staged {
            Staged::Thunk(id) => scheduler::run(ctx, self.pool.clone(), id).await,
            Staged::Chunk(chunk) => match stager::thunkize(ctx, chunk)? {
                Staged::Thunk(id) => scheduler::run(ctx, self.pool.clone(), id).await,
                Staged::Chunk(resolved) => Ok(TaskValue::Chunk(resolved)),
            },
        }
    }

    /// `gather(ctx, c) / gather(c)` (§6): compute then materialize the
    /// result into the caller's address space. Plain data is already local;
    /// a chunk is fetched through `WorkerPool::materialize`, the boundary
    /// method standing in for the out-of-scope result-materialization
    /// collaborator (§1).
    pub async fn gather(&self, c: &Computation) -> Result<TaskValue> {
        let computed = self.compute(c).await?;
        self.gather_computed(&computed).await
    }

    pub async fn gather_computed(&self, computed: &Computed) -> Result<TaskValue> {
        match computed.value() {
            TaskValue::Data(_) => Ok(computed.value().clone()),
            TaskValue::Chunk(chunk) => self.gather_chunk(chunk).await,
        }
    }

    async fn gather_chunk(&self, chunk: &AbstractChunk) -> Result<TaskValue> {
        match chunk {
            AbstractChunk::Chunk(mc) => self.pool.materialize(&mc.worker, mc.id).await,
            AbstractChunk::View { parent, .. } => {
                self.pool.materialize(&parent.worker, parent.id).await
            }
            AbstractChunk::Cat { cells, .. } => {
                let mut values = Vec::with_capacity(cells.len());
                for cell in cells {
                    match cell {
                        CatCell::Resolved(mc) => {
                            values.push(self.pool.materialize(&mc.worker, mc.id).await?);
                        }
                        CatCell::Pending(_) => {
                            return Err(EngineError::structural(
                                "gather on a Cat with an unresolved cell",
                            ))
                        }
                    }
                }
                Ok(TaskValue::data(values))
            }
        }
    }

    /// `free!(computed, force, cache)` (§6): explicit release, run directly
    /// against the pool rather than through the finalizer queue since the
    /// caller here is already on a task that can afford to `.await`.
    pub async fn free(&self, computed: &Computed, force: bool, cache: bool) {
        if let TaskValue::Chunk(chunk) = computed.value() {
            lifetime::free(self.pool.as_ref(), chunk, force, cache).await;
        }
    }

    /// `debug_compute(ctx, args…; profile=false)` (§6): compute with timing
    /// extraction. Returns the elapsed wall-clock time alongside the
    /// result; when `profile` is set, also emits an `info!` line, following
    /// the teacher's habit of surfacing timings through `tracing` rather
    /// than a bespoke metrics sink.
    pub async fn debug_compute(
        &self,
        c: &Computation,
        profile: bool,
    ) -> Result<(Computed, Duration)> {
        let start = Instant::now();
        let computed = self.compute(c).await?;
        let elapsed = start.elapsed();
        if profile {
            info!(elapsed_ms = elapsed.as_millis() as u64, "debug_compute finished");
        }
        Ok((computed, elapsed))
    }
}

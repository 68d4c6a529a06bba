//! The worker protocol (§4.5): the RPC transport boundary, abstracted as a
//! trait so the scheduler doesn't care whether a worker is an in-process
//! mock or a real remote process. Grounded on the teacher's `StageHandler`
//! trait (pipeline.rs) — a pluggable, async, `Send + Sync` handler the
//! orchestrator invokes without knowing its concrete type.

use crate::chunk::{AbstractChunk, ChunkId, MaterializedChunk, WorkerId};
use crate::error::{EngineError, Result};
use crate::thunk::{TaskValue, ThunkFn, ThunkId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

/// The outcome a worker reports back over the completion channel, or a
/// captured failure (remote exception or transport error) per §4.3 step 2.
#[derive(Debug)]
pub enum TaskOutcome {
    Success(TaskValue),
    Failed(EngineError),
}

/// A single message on the master's completion channel.
#[derive(Debug)]
pub struct Completion {
    pub worker: WorkerId,
    pub thunk_id: ThunkId,
    pub outcome: TaskOutcome,
}

/// The transport boundary a worker process exposes to the master. A real
/// deployment would back this with an RPC client; `mock::MockWorkerPool`
/// backs it with in-process tokio tasks for tests and the smoke binary.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// The workers currently known to the pool.
    fn workers(&self) -> Vec<WorkerId>;

    /// Runs `f(data...)` on `worker` (§4.5 `do_task`): moves each datum to
    /// the worker, times the move and the computation, and returns either
    /// the raw value (`get_result`) or a chunk handle (honoring `persist`).
    async fn do_task(
        &self,
        worker: &WorkerId,
        thunk_id: ThunkId,
        f: ThunkFn,
        data: Vec<TaskValue>,
        get_result: bool,
        persist: bool,
    ) -> Result<TaskValue>;

    /// Asks `worker` to confirm it still holds `chunk_id` (the cache-hit
    /// short-circuit's "unrelease"). Returns the value if still live.
    async fn unrelease(&self, worker: &WorkerId, chunk_id: ChunkId) -> Result<Option<TaskValue>>;

    /// Releases worker-side storage for `chunk_id` (§4.6 `free!`). When
    /// `cache` is true the storage moves to a keep-alive registry instead of
    /// being dropped outright.
    async fn free(&self, worker: &WorkerId, chunk_id: ChunkId, force: bool, cache: bool);

    /// Moves a chunk's data into the caller's address space. This is the one
    /// boundary method belonging to the "result materialization utilities"
    /// §1 lists as an out-of-scope collaborator — a real deployment backs it
    /// with whatever transport `gather` uses to pull bytes home; the mock
    /// pool backs it with a plain local lookup since there's no network to
    /// cross.
    async fn materialize(&self, worker: &WorkerId, chunk_id: ChunkId) -> Result<TaskValue>;
}

/// The master-side launcher (§4.5 `async_apply`): starts a background task
/// that calls `do_task` on `worker` and forwards the reply to `completions`.
/// Transport errors are caught here and placed on the channel as failures,
/// matching the teacher's `tokio::spawn` + join pattern in `run_dag`, but
/// fed into a single channel instead of `join_all`'d in lockstep — this
/// engine dispatches dynamically rather than phase-by-phase.
#[instrument(skip(pool, f, data, completions), fields(thunk_id = %thunk_id))]
pub fn async_apply(
    pool: Arc<dyn WorkerPool>,
    worker: WorkerId,
    thunk_id: ThunkId,
    f: ThunkFn,
    data: Vec<TaskValue>,
    get_result: bool,
    persist: bool,
    timeout_ms: u64,
    completions: mpsc::Sender<Completion>,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::Duration::from_millis(timeout_ms);
        let outcome = match tokio::time::timeout(
            deadline,
            pool.do_task(&worker, thunk_id, f, data, get_result, persist),
        )
        .await
        {
            Ok(Ok(value)) => TaskOutcome::Success(value),
            Ok(Err(e)) => TaskOutcome::Failed(e),
            Err(_) => TaskOutcome::Failed(EngineError::Timeout {
                thunk_id: thunk_id.as_u64(),
                worker: worker.to_string(),
                millis: timeout_ms,
            }),
        };

        debug!(worker = %worker, "task completed");
        let _ = completions
            .send(Completion {
                worker,
                thunk_id,
                outcome,
            })
            .await;
    });
}

/// `_move(ctx, proc, x)` (§4.5 step 1): fetches `x` to `worker`. Plain data
/// is already in-process (identity); a chunk not already owned by `worker`
/// would be gathered from its owner — in this in-process engine "gathering"
/// is a cheap clone of the handle, since there is no real network fabric.
pub fn move_to_worker(_worker: &WorkerId, value: &TaskValue) -> TaskValue {
    value.clone()
}

/// Wraps a raw computed datum as a chunk owned by `worker`, honoring
/// `persist` (§4.5 step 3, the non-`get_result` branch).
pub fn wrap_as_chunk(worker: &WorkerId, chunk_id: ChunkId, persist: bool) -> AbstractChunk {
    AbstractChunk::Chunk(Arc::new(MaterializedChunk::new(
        chunk_id,
        worker.clone(),
        0,
        persist,
    )))
}

//! An in-process `WorkerPool` for tests and the smoke binary. Grounded on
//! the teacher's `CheckpointManager::new_in_memory()` — a trait-compatible
//! stand-in with no real I/O, backed by concurrent maps instead of a store.

use crate::chunk::{AbstractChunk, ChunkId, WorkerId};
use crate::error::{EngineError, Result};
use crate::thunk::{TaskValue, ThunkFn, ThunkId};
use crate::worker::{move_to_worker, wrap_as_chunk, WorkerPool};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug_span, Instrument};

/// In-memory worker pool: every "worker" is just a name, and materialized
/// chunks live in a shared keep-alive table keyed by `ChunkId`.
pub struct MockWorkerPool {
    workers: Vec<WorkerId>,
    next_chunk_id: AtomicU64,
    live_chunks: DashMap<ChunkId, TaskValue>,
    /// The raw computed value behind each chunk handle — a real worker
    /// would hold this as worker-local bytes; the mock keeps it alongside
    /// the handle so `materialize` has something to hand back.
    payloads: DashMap<ChunkId, TaskValue>,
    /// Artificial per-task delay, exercised by the timeout test and useful
    /// for smoke-testing the dispatch loop's concurrency cap.
    pub task_delay: std::time::Duration,
}

impl MockWorkerPool {
    pub fn new(workers: Vec<WorkerId>) -> Self {
        Self {
            workers,
            next_chunk_id: AtomicU64::new(0),
            live_chunks: DashMap::new(),
            payloads: DashMap::new(),
            task_delay: std::time::Duration::from_millis(2),
        }
    }

    fn alloc_chunk_id(&self) -> ChunkId {
        ChunkId(self.next_chunk_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl WorkerPool for MockWorkerPool {
    fn workers(&self) -> Vec<WorkerId> {
        self.workers.clone()
    }

    async fn do_task(
        &self,
        worker: &WorkerId,
        thunk_id: ThunkId,
        f: ThunkFn,
        data: Vec<TaskValue>,
        get_result: bool,
        persist: bool,
    ) -> Result<TaskValue> {
        let fetched: Vec<TaskValue> = {
            let _comm = debug_span!("comm", worker = %worker, thunk_id = %thunk_id).entered();
            data.iter().map(|v| move_to_worker(worker, v)).collect()
        };

        tokio::time::sleep(self.task_delay).await;

        let result = async { f(&fetched) }
            .instrument(debug_span!("compute", worker = %worker, thunk_id = %thunk_id))
            .await
            .map_err(|e| EngineError::Computation {
                worker: worker.to_string(),
                message: e.to_string(),
            })?;

        if get_result {
            return Ok(result);
        }

        let chunk_id = self.alloc_chunk_id();
        self.payloads.insert(chunk_id, result);
        let chunk = wrap_as_chunk(worker, chunk_id, persist);
        let chunk_value = TaskValue::Chunk(chunk);
        self.live_chunks.insert(chunk_id, chunk_value.clone());
        Ok(chunk_value)
    }

    async fn unrelease(&self, _worker: &WorkerId, chunk_id: ChunkId) -> Result<Option<TaskValue>> {
        Ok(self.live_chunks.get(&chunk_id).map(|v| v.clone()))
    }

    async fn free(&self, _worker: &WorkerId, chunk_id: ChunkId, force: bool, cache: bool) {
        if cache {
            return;
        }
        if force {
            self.live_chunks.remove(&chunk_id);
            self.payloads.remove(&chunk_id);
            return;
        }
        if let Some(entry) = self.live_chunks.get(&chunk_id) {
            if let TaskValue::Chunk(AbstractChunk::Chunk(mc)) = entry.value() {
                if mc.is_persisted() {
                    return;
                }
            }
        }
        self.live_chunks.remove(&chunk_id);
        self.payloads.remove(&chunk_id);
    }

    async fn materialize(&self, _worker: &WorkerId, chunk_id: ChunkId) -> Result<TaskValue> {
        self.payloads.get(&chunk_id).map(|v| v.clone()).ok_or_else(|| {
            EngineError::structural(format!("chunk {} not found on mock worker", chunk_id.0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn do_task_wraps_computed_value_as_a_chunk_by_default() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(7i32)));
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], false, false)
            .await
            .unwrap();
        assert!(matches!(result, TaskValue::Chunk(_)));
    }

    #[tokio::test]
    async fn do_task_returns_raw_value_when_get_result_is_set() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(7i32)));
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], true, false)
            .await
            .unwrap();
        assert_eq!(*result.downcast_ref::<i32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn do_task_surfaces_computation_failure() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| {
            Err(EngineError::structural("boom"))
        });
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], true, false)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unrelease_finds_a_still_live_chunk() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(1i32)));
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], false, false)
            .await
            .unwrap();
        let chunk_id = match result {
            TaskValue::Chunk(AbstractChunk::Chunk(mc)) => mc.id,
            _ => panic!("expected chunk"),
        };
        let found = pool.unrelease(&WorkerId("w1".into()), chunk_id).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn free_without_force_drops_an_unpersisted_chunk() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(1i32)));
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], false, false)
            .await
            .unwrap();
        let chunk_id = match result {
            TaskValue::Chunk(AbstractChunk::Chunk(mc)) => mc.id,
            _ => panic!("expected chunk"),
        };
        pool.free(&WorkerId("w1".into()), chunk_id, false, false).await;
        assert!(pool.unrelease(&WorkerId("w1".into()), chunk_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn materialize_returns_the_raw_computed_value() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let f: ThunkFn = Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(99i32)));
        let result = pool
            .do_task(&WorkerId("w1".into()), ThunkId::from_raw(1), f, vec![], false, false)
            .await
            .unwrap();
        let chunk_id = match result {
            TaskValue::Chunk(AbstractChunk::Chunk(mc)) => mc.id,
            _ => panic!("expected chunk"),
        };
        let local = pool.materialize(&WorkerId("w1".into()), chunk_id).await.unwrap();
        assert_eq!(*local.downcast_ref::<i32>().unwrap(), 99);
    }

    #[tokio::test]
    async fn materialize_fails_for_an_unknown_chunk() {
        let pool = MockWorkerPool::new(vec![WorkerId("w1".into())]);
        let result = pool.materialize(&WorkerId("w1".into()), ChunkId(404)).await;
        assert!(result.is_err());
    }
}

//! Lifetime management (§4.6): pinning persisted chunks, releasing
//! worker-side storage, and the non-blocking finalizer queue that lets a
//! `Computed` value hand off its free to a background task instead of
//! blocking a drop. Grounded on the teacher's `CheckpointManager`'s
//! `Arc<Mutex<Vec<_>>>` registry, generalized to an async hand-off queue —
//! a finalizer cannot `.await` a `Mutex::lock` (or any lock) without
//! risking blocking the thread it runs on, so this uses a bounded
//! `tokio::sync::mpsc` channel instead.

use crate::chunk::{AbstractChunk, ChunkId, WorkerId};
use crate::worker::WorkerPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A pending release request handed off by a finalizer. Carries its own
/// target worker — a `Computed` value's chunk can live on any worker in the
/// pool, so the drain loop can't bake in a single fixed destination.
struct FreeRequest {
    worker: WorkerId,
    chunk_id: ChunkId,
    force: bool,
    cache: bool,
}

/// `persist!(chunk)` (§4.6): marks every materialized cell reachable from
/// `chunk` as pinned, so a later `free!` with `force=false` is a no-op.
pub fn persist(chunk: &AbstractChunk) {
    match chunk {
        AbstractChunk::Chunk(mc) => mc.mark_persisted(),
        AbstractChunk::View { parent, .. } => parent.mark_persisted(),
        AbstractChunk::Cat { cells, .. } => {
            for cell in cells {
                if let crate::chunk::CatCell::Resolved(mc) = cell {
                    mc.mark_persisted();
                }
            }
        }
    }
}

/// The non-blocking hand-off queue finalizers enqueue frees onto. Cloning
/// shares the same underlying channel; a full queue drops the request
/// (logged) rather than block the caller — finalizers must not block.
#[derive(Clone)]
pub struct FinalizerQueue {
    sender: mpsc::Sender<FreeRequest>,
}

impl FinalizerQueue {
    /// Spawns the background drain task and returns a handle to enqueue
    /// onto it. `pool` is the worker pool the drained requests are applied
    /// against.
    pub fn spawn(pool: Arc<dyn WorkerPool>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel(capacity);
        tokio::spawn(async move {
            while let Some(req) = receiver.recv().await {
                debug!(chunk_id = req.chunk_id.0, worker = %req.worker, "finalizer draining free request");
                pool.free(&req.worker, req.chunk_id, req.force, req.cache).await;
            }
        });
        Self { sender }
    }

    /// Enqueues a release without blocking. Drops (with a warning) if the
    /// queue is saturated, which only affects when storage is reclaimed,
    /// never correctness.
    pub fn enqueue_free(&self, worker: WorkerId, chunk_id: ChunkId, force: bool, cache: bool) {
        let req = FreeRequest {
            worker,
            chunk_id,
            force,
            cache,
        };
        if self.sender.try_send(req).is_err() {
            warn!(chunk_id = chunk_id.0, "finalizer queue saturated, dropping free request");
        }
    }

    /// Enqueues a forced, non-caching release for every materialized cell
    /// reachable from `chunk` — the shape `Computed`'s drop glue needs
    /// (§3 Lifetimes: "schedules a forced free of that chunk").
    pub fn enqueue_free_chunk(&self, chunk: &AbstractChunk) {
        match chunk {
            AbstractChunk::Chunk(mc) => self.enqueue_free(mc.worker.clone(), mc.id, true, false),
            AbstractChunk::View { .. } => {}
            AbstractChunk::Cat { cells, .. } => {
                for cell in cells {
                    if let crate::chunk::CatCell::Resolved(mc) = cell {
                        self.enqueue_free(mc.worker.clone(), mc.id, true, false);
                    }
                }
            }
        }
    }
}

/// `free!(chunk, force, cache)` (§4.6) for the synchronous/direct path —
/// used by the scheduler's `finish_task`, which already runs on the single
/// master task and can afford to `.await` the pool directly. The finalizer
/// queue (above) exists specifically for contexts that cannot await,
/// i.e. drop glue.
pub async fn free(pool: &dyn WorkerPool, chunk: &AbstractChunk, force: bool, cache: bool) {
    match chunk {
        AbstractChunk::Chunk(mc) => {
            if !force && mc.is_persisted() {
                return;
            }
            pool.free(&mc.worker, mc.id, force, cache).await;
        }
        AbstractChunk::View { .. } => {
            // A view borrows its parent's liveness; freeing it directly has
            // nothing of its own to release.
        }
        AbstractChunk::Cat { cells, .. } => {
            for cell in cells {
                if let crate::chunk::CatCell::Resolved(mc) = cell {
                    if !force && mc.is_persisted() {
                        continue;
                    }
                    pool.free(&mc.worker, mc.id, force, cache).await;
                }
            }
        }
    }
}

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies a worker process in the pool. Opaque to the scheduler beyond
/// equality and display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a materialized chunk on some worker. Distinct from `ThunkId`:
/// a Thunk describes *how* to produce a value, a `ChunkId` names data that
/// already exists somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

/// Declared element type of a `Cat`'s cells, carried so realization can
/// rebuild a resolved Cat with the same layout metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType(pub String);

/// Per-axis chunk sizes and overall domain shape for a `Cat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatLayout {
    /// Extent of the aggregate along each axis (number of cells, not bytes).
    pub domain: Vec<usize>,
    /// Size of each individual chunk along each axis.
    pub chunk_sizes: Vec<usize>,
    pub chunk_type: ChunkType,
}

/// A handle to data living on some worker, or a deferred description of one.
///
/// `Cat` is the one variant that can be "deferred": a `Cat` containing a
/// `CatCell::Pending` thunk handle participates in the graph as a node that
/// still needs `thunkize` to fuse it into a single resolved value.
#[derive(Debug, Clone)]
pub enum AbstractChunk {
    /// A single materialized datum living on one worker.
    Chunk(Arc<MaterializedChunk>),
    /// A slice of another chunk; never deferred on its own (it borrows the
    /// liveness of its parent).
    View {
        parent: Arc<MaterializedChunk>,
        range: std::ops::Range<usize>,
    },
    /// A structured aggregate of chunks arranged in an N-dimensional grid.
    Cat {
        layout: CatLayout,
        cells: Vec<CatCell>,
    },
}

/// A cell of a `Cat`: either already a concrete chunk, or still pending
/// (identified by the `ThunkId` that will produce it).
#[derive(Debug, Clone)]
pub enum CatCell {
    Resolved(Arc<MaterializedChunk>),
    Pending(crate::thunk::ThunkId),
}

impl AbstractChunk {
    /// A `Cat` is deferred iff any of its cells is still pending. Plain
    /// `Chunk`/`View` values are never deferred — they already exist.
    pub fn is_deferred(&self) -> bool {
        match self {
            AbstractChunk::Chunk(_) | AbstractChunk::View { .. } => false,
            AbstractChunk::Cat { cells, .. } => {
                cells.iter().any(|c| matches!(c, CatCell::Pending(_)))
            }
        }
    }

    /// The worker(s) holding this chunk's data, used to derive affinity.
    /// `View` reports its parent's worker; a resolved `Cat` reports the
    /// union of its cells' workers (weight 1 per occurrence).
    pub fn owning_workers(&self) -> Vec<WorkerId> {
        match self {
            AbstractChunk::Chunk(c) => vec![c.worker.clone()],
            AbstractChunk::View { parent, .. } => vec![parent.worker.clone()],
            AbstractChunk::Cat { cells, .. } => cells
                .iter()
                .filter_map(|cell| match cell {
                    CatCell::Resolved(c) => Some(c.worker.clone()),
                    CatCell::Pending(_) => None,
                })
                .collect(),
        }
    }
}

/// A single-worker materialized datum. `persist` mirrors the Thunk flag of
/// the same name: when set, workers will not reclaim it on their own and
/// `free!` with `force=false` is a no-op.
#[derive(Debug)]
pub struct MaterializedChunk {
    pub id: ChunkId,
    pub worker: WorkerId,
    pub byte_len: usize,
    pub persist: std::sync::atomic::AtomicBool,
}

impl MaterializedChunk {
    pub fn new(id: ChunkId, worker: WorkerId, byte_len: usize, persist: bool) -> Self {
        Self {
            id,
            worker,
            byte_len,
            persist: std::sync::atomic::AtomicBool::new(persist),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persist.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn mark_persisted(&self) {
        self.persist.store(true, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64, worker: &str) -> Arc<MaterializedChunk> {
        Arc::new(MaterializedChunk::new(
            ChunkId(id),
            WorkerId(worker.to_string()),
            128,
            false,
        ))
    }

    #[test]
    fn plain_chunk_is_never_deferred() {
        let c = AbstractChunk::Chunk(chunk(1, "w1"));
        assert!(!c.is_deferred());
    }

    #[test]
    fn cat_with_pending_cell_is_deferred() {
        let layout = CatLayout {
            domain: vec![2],
            chunk_sizes: vec![1],
            chunk_type: ChunkType("bytes".into()),
        };
        let c = AbstractChunk::Cat {
            layout,
            cells: vec![
                CatCell::Resolved(chunk(1, "w1")),
                CatCell::Pending(crate::thunk::ThunkId::from_raw(7)),
            ],
        };
        assert!(c.is_deferred());
    }

    #[test]
    fn cat_with_all_cells_resolved_is_not_deferred() {
        let layout = CatLayout {
            domain: vec![2],
            chunk_sizes: vec![1],
            chunk_type: ChunkType("bytes".into()),
        };
        let c = AbstractChunk::Cat {
            layout,
            cells: vec![
                CatCell::Resolved(chunk(1, "w1")),
                CatCell::Resolved(chunk(2, "w2")),
            ],
        };
        assert!(!c.is_deferred());
        assert_eq!(c.owning_workers().len(), 2);
    }

    #[test]
    fn persist_flag_round_trips() {
        let c = MaterializedChunk::new(ChunkId(1), WorkerId("w1".into()), 64, false);
        assert!(!c.is_persisted());
        c.mark_persisted();
        assert!(c.is_persisted());
    }
}

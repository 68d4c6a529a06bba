//! A distributed task-graph execution engine: a dynamic dataflow scheduler
//! that turns a deferred computation into a concrete DAG of memoized,
//! worker-affine tasks and drives it to completion.
//!
//! The pieces, leaves first:
//! - [`chunk`] / [`thunk`]: the data model — handles to worker-resident data
//!   (`AbstractChunk`) and the executable DAG node (`Thunk`).
//! - [`computation`]: the deferred-computation description callers build
//!   (`Computation`) and the extension point for new variants (`LeafStage`).
//! - [`stager`]: turns a `Computation` into a `Thunk` graph, memoized per
//!   [`stager::Context`].
//! - [`graph`]: dependents/offspring/total-order derivations over the DAG.
//! - [`affinity`]: worker-affinity-aware ready-task selection.
//! - [`scheduler`]: the dispatch loop itself.
//! - [`worker`]: the master/worker execution protocol (`WorkerPool`).
//! - [`lifetime`]: reference counting and non-blocking finalization of
//!   worker-side data.
//! - [`api`]: the `Engine` entry point (`compute`/`gather`/`free`/
//!   `debug_compute`) callers actually drive.
//! - [`mock`]: an in-process `WorkerPool` for tests and the smoke binary.
//! - [`config`] / [`error`]: ambient configuration and the crate-wide error type.

pub mod affinity;
pub mod api;
pub mod chunk;
pub mod computation;
pub mod config;
pub mod error;
pub mod graph;
pub mod lifetime;
pub mod mock;
pub mod scheduler;
pub mod stager;
pub mod thunk;
pub mod worker;

pub use api::{Computed, Engine};
pub use chunk::{AbstractChunk, CatCell, CatLayout, ChunkId, ChunkType, MaterializedChunk, WorkerId};
pub use computation::{Computation, LeafStage};
pub use config::EngineConfig;
pub use error::{EngineError, FailureKind, Result};
pub use stager::Context;
pub use thunk::{TaskValue, Thunk, ThunkFn, ThunkId, ThunkInput};
pub use worker::WorkerPool;

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {
        assert_eq!(2 + 2, 4);
    }
}

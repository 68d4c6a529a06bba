use crate::chunk::{AbstractChunk, ChunkId, MaterializedChunk, WorkerId};
use crate::error::Result;
use crate::thunk::ThunkId;
use std::sync::Arc;

/// The stager extension point (§6): implementers of new Computation
/// variants provide `stage` and optionally an `affinity` override. Mirrors
/// the teacher's `StageHandler` trait — a pluggable-handler table keyed by
/// variant rather than subclass dispatch (§9 "replace with a tagged variant
/// type and a dispatch table").
pub trait LeafStage: Send + Sync {
    /// Stage this leaf into a Thunk, registering it (and any Thunks it
    /// depends on) with `ctx`. Implementations must be referentially
    /// transparent: staging an equal leaf twice under the same pointer
    /// identity must be idempotent from the caller's perspective (the
    /// stager's memoization is what actually enforces this — see
    /// `stager::cached_stage`).
    fn stage(&self, ctx: &crate::stager::Context) -> Result<ThunkId>;
}

/// An opaque, possibly-deferred description of a value (§3).
#[derive(Clone)]
pub enum Computation {
    /// User-defined; knows how to stage itself into chunks.
    Leaf(Arc<dyn LeafStage>),
    /// An ordered sequence of Computations whose result is the tuple of
    /// their results.
    Tuple(Vec<Computation>),
    /// Marks its inner Computation's result to be retained after first use.
    Cached(Box<Computation>),
    /// Already-materialized; participates in the graph as a leaf.
    Computed(Arc<MaterializedChunk>),
}

/// The identity key the stager's memoization cache is keyed on. Two
/// `Computation` values are "equal" for staging purposes iff they produce
/// the same `CompKey` — pointer identity for `Leaf` (since leaves carry
/// arbitrary closures with no structural equality), recursive structural
/// identity for `Tuple`/`Cached`, and chunk identity for `Computed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompKey {
    Leaf(usize),
    Tuple(Vec<CompKey>),
    Cached(Box<CompKey>),
    Computed(ChunkId),
}

impl Computation {
    pub fn leaf(stage: impl LeafStage + 'static) -> Self {
        Computation::Leaf(Arc::new(stage))
    }

    pub fn tuple(cs: Vec<Computation>) -> Self {
        Computation::Tuple(cs)
    }

    /// `cached(c) -> Computation`: mark `c` as persist-after-compute (§6).
    pub fn cached(self) -> Self {
        Computation::Cached(Box::new(self))
    }

    pub fn computed(chunk: Arc<MaterializedChunk>) -> Self {
        Computation::Computed(chunk)
    }

    pub fn key(&self) -> CompKey {
        match self {
            Computation::Leaf(l) => CompKey::Leaf(Arc::as_ptr(l) as *const () as usize),
            Computation::Tuple(cs) => CompKey::Tuple(cs.iter().map(Computation::key).collect()),
            Computation::Cached(inner) => CompKey::Cached(Box::new(inner.key())),
            Computation::Computed(c) => CompKey::Computed(c.id),
        }
    }
}

impl std::fmt::Debug for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Computation::Leaf(_) => write!(f, "Computation::Leaf(..)"),
            Computation::Tuple(cs) => f.debug_tuple("Computation::Tuple").field(cs).finish(),
            Computation::Cached(inner) => {
                f.debug_tuple("Computation::Cached").field(inner).finish()
            }
            Computation::Computed(c) => write!(f, "Computation::Computed({:?})", c.id),
        }
    }
}

/// A Computed leaf that is itself a `Cat` with some cells still pending
/// realization. Not a core `Computation` variant (a Cat is a chunk-layer
/// concept, §3), but exposed here so callers composing Cats of Thunks can
/// hand them to `stager::thunkize` directly without going through `stage`.
pub fn deferred_cat(chunk: AbstractChunk) -> Option<AbstractChunk> {
    if chunk.is_deferred() {
        Some(chunk)
    } else {
        None
    }
}

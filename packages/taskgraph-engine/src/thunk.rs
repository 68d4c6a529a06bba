use crate::chunk::{AbstractChunk, WorkerId};
use crate::error::Result;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Globally unique, monotonically assigned Thunk identifier. Ordering on
/// `ThunkId` is the tie-break ordering among otherwise-equal dispatch
/// candidates (§3), so this is a plain counter rather than a `Uuid` —
/// a uuid has no useful ordering for that purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThunkId(u64);

impl ThunkId {
    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ThunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thunk#{}", self.0)
    }
}

static NEXT_THUNK_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates the next globally unique Thunk id. Monotonic within a process.
pub fn next_thunk_id() -> ThunkId {
    ThunkId(NEXT_THUNK_ID.fetch_add(1, Ordering::Relaxed))
}

/// A value flowing along a Thunk's inputs or out of its function: either a
/// chunk handle (data living on a worker) or an opaque in-process datum.
/// Workers in this crate are in-process (the RPC transport is an external
/// collaborator, see SPEC_FULL §10.5/§4.5), so "moving" a `Data` value to a
/// worker is identity, same as the spec's plain-datum case.
#[derive(Clone)]
pub enum TaskValue {
    Chunk(AbstractChunk),
    Data(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for TaskValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskValue::Chunk(c) => write!(f, "TaskValue::Chunk({:?})", c),
            TaskValue::Data(_) => write!(f, "TaskValue::Data(..)"),
        }
    }
}

impl TaskValue {
    pub fn data<T: Any + Send + Sync>(value: T) -> Self {
        TaskValue::Data(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            TaskValue::Data(d) => d.downcast_ref::<T>(),
            TaskValue::Chunk(_) => None,
        }
    }

    /// Affinity this value contributes: the owning workers of a chunk
    /// (weight 1 each), or nothing for plain data. `pub(crate)` so the
    /// scheduler can fold a resolved input's affinity into its consumer's.
    pub(crate) fn affinity(&self) -> Vec<(WorkerId, u32)> {
        match self {
            TaskValue::Chunk(c) => c.owning_workers().into_iter().map(|w| (w, 1)).collect(),
            TaskValue::Data(_) => Vec::new(),
        }
    }
}

/// An input to a Thunk: either another Thunk (a dependency edge) or a
/// non-deferred value already available.
#[derive(Clone)]
pub enum ThunkInput {
    Thunk(ThunkId),
    Value(TaskValue),
}

impl ThunkInput {
    pub fn as_thunk(&self) -> Option<ThunkId> {
        match self {
            ThunkInput::Thunk(id) => Some(*id),
            ThunkInput::Value(_) => None,
        }
    }
}

/// The function a Thunk invokes, given its resolved inputs. Boxed because
/// Thunks of different arity/closure-captures must share one type.
pub type ThunkFn = Arc<dyn Fn(&[TaskValue]) -> Result<TaskValue> + Send + Sync>;

/// A node in the executable DAG (§3).
pub struct Thunk {
    pub id: ThunkId,
    pub f: ThunkFn,
    pub inputs: Vec<ThunkInput>,
    /// If true, retain the result across `compute` invocations. An atomic
    /// because `Cached(c)` marks an already-staged, already-shared Thunk
    /// after the fact (§4.1): "stage(ctx, Cached(c)) ... marks the result
    /// as persisted".
    cache: std::sync::atomic::AtomicBool,
    /// A previously computed, still-live result, if any. Verified for
    /// liveness (not blindly trusted) before the scheduler relies on it.
    pub cache_ref: std::sync::Mutex<Option<CacheRef>>,
    /// If true, run on the master with inputs unmoved (no data movement).
    pub meta: bool,
    /// If true, the worker returns the raw computed value rather than
    /// wrapping it as a chunk.
    pub get_result: bool,
    /// If true, the produced chunk is pinned so workers won't reclaim it.
    /// Same after-the-fact-mutation rationale as `cache`.
    persist: std::sync::atomic::AtomicBool,
}

/// A reference to a previously computed result that might still be live on
/// its owning worker. The scheduler must ask the worker to confirm liveness
/// (the cache-hit short-circuit's "unrelease") before trusting this.
#[derive(Debug, Clone)]
pub struct CacheRef {
    pub worker: WorkerId,
    pub value: TaskValue,
}

impl Thunk {
    pub fn new(f: ThunkFn, inputs: Vec<ThunkInput>) -> Self {
        Self {
            id: next_thunk_id(),
            f,
            inputs,
            cache: std::sync::atomic::AtomicBool::new(false),
            cache_ref: std::sync::Mutex::new(None),
            meta: false,
            get_result: false,
            persist: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_cache(self, cache: bool) -> Self {
        self.set_cache(cache);
        self
    }

    pub fn with_meta(mut self, meta: bool) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_get_result(mut self, get_result: bool) -> Self {
        self.get_result = get_result;
        self
    }

    pub fn with_persist(self, persist: bool) -> Self {
        self.set_persist(persist);
        self
    }

    pub fn is_cache(&self) -> bool {
        self.cache.load(Ordering::Acquire)
    }

    pub fn set_cache(&self, cache: bool) {
        self.cache.store(cache, Ordering::Release);
    }

    pub fn is_persist(&self) -> bool {
        self.persist.load(Ordering::Acquire)
    }

    pub fn set_persist(&self, persist: bool) {
        self.persist.store(persist, Ordering::Release);
    }

    /// The Thunk-input subset of `inputs`, in order — used to seed
    /// `waiting[n]` at scheduler initialization.
    pub fn thunk_inputs(&self) -> impl Iterator<Item = ThunkId> + '_ {
        self.inputs.iter().filter_map(|i| i.as_thunk())
    }

    /// Affinity of this Thunk: the concatenation of affinities of its
    /// inputs (§4.4). Only non-deferred `Value` inputs contribute directly;
    /// Thunk inputs contribute through the cache once resolved, so this is
    /// evaluated by the scheduler against resolved values, not here.
    pub fn static_affinity(&self) -> Vec<(WorkerId, u32)> {
        self.inputs
            .iter()
            .filter_map(|i| match i {
                ThunkInput::Value(v) => Some(v.affinity()),
                ThunkInput::Thunk(_) => None,
            })
            .flatten()
            .collect()
    }
}

impl std::fmt::Debug for Thunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thunk")
            .field("id", &self.id)
            .field("inputs", &self.inputs.len())
            .field("cache", &self.is_cache())
            .field("meta", &self.meta)
            .field("get_result", &self.get_result)
            .field("persist", &self.is_persist())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_fn() -> ThunkFn {
        Arc::new(|inputs: &[TaskValue]| Ok(inputs[0].clone()))
    }

    #[test]
    fn thunk_ids_are_monotonic() {
        let a = Thunk::new(identity_fn(), vec![]);
        let b = Thunk::new(identity_fn(), vec![]);
        assert!(b.id.as_u64() > a.id.as_u64());
    }

    #[test]
    fn thunk_inputs_filters_only_thunk_dependencies() {
        let a = Thunk::new(identity_fn(), vec![]);
        let t = Thunk::new(
            identity_fn(),
            vec![
                ThunkInput::Thunk(a.id),
                ThunkInput::Value(TaskValue::data(42i32)),
            ],
        );
        let deps: Vec<_> = t.thunk_inputs().collect();
        assert_eq!(deps, vec![a.id]);
    }

    #[test]
    fn builder_flags_set_independently() {
        let t = Thunk::new(identity_fn(), vec![])
            .with_cache(true)
            .with_meta(true)
            .with_persist(true);
        assert!(t.is_cache());
        assert!(t.meta);
        assert!(t.is_persist());
        assert!(!t.get_result);
    }

    #[test]
    fn static_affinity_ignores_thunk_inputs() {
        let a = Thunk::new(identity_fn(), vec![]);
        let chunk = crate::chunk::AbstractChunk::Chunk(Arc::new(
            crate::chunk::MaterializedChunk::new(
                crate::chunk::ChunkId(1),
                WorkerId("w1".into()),
                8,
                false,
            ),
        ));
        let t = Thunk::new(
            identity_fn(),
            vec![
                ThunkInput::Thunk(a.id),
                ThunkInput::Value(TaskValue::Chunk(chunk)),
            ],
        );
        let affinity = t.static_affinity();
        assert_eq!(affinity, vec![(WorkerId("w1".into()), 1)]);
    }
}

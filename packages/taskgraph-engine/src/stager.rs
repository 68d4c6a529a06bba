use crate::chunk::{AbstractChunk, CatCell, WorkerId};
use crate::computation::{CompKey, Computation};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::thunk::{TaskValue, Thunk, ThunkFn, ThunkId, ThunkInput};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// What staging a `Computation` produces: either a Thunk node, or a value
/// that already exists (a plain Chunk/View, or a resolved Cat).
#[derive(Clone, Debug)]
pub enum Staged {
    Thunk(ThunkId),
    Chunk(AbstractChunk),
}

impl Staged {
    fn into_thunk_input(self) -> ThunkInput {
        match self {
            Staged::Thunk(id) => ThunkInput::Thunk(id),
            Staged::Chunk(c) => ThunkInput::Value(TaskValue::Chunk(c)),
        }
    }
}

/// The scheduler's ambient configuration: available workers, config knobs,
/// and the per-Context Thunk registry + memoized stager cache.
///
/// The stager cache lives *inside* `Context` rather than behind a global
/// weak-keyed map, which is the simplest realization of §9's "weak-keyed
/// context cache" note that still satisfies its actual requirement (the
/// cache must not outlive, or prevent GC of, its Context): a field cannot
/// outlive the struct that owns it, so dropping a `Context` always drops
/// its cache, with no risk of a retain cycle keeping the Context alive.
pub struct Context {
    pub workers: Vec<WorkerId>,
    pub config: EngineConfig,
    thunks: DashMap<ThunkId, Arc<Thunk>>,
    comp_cache: DashMap<CompKey, Staged>,
}

impl Context {
    pub fn new(workers: Vec<WorkerId>, config: EngineConfig) -> Self {
        Self {
            workers,
            config,
            thunks: DashMap::new(),
            comp_cache: DashMap::new(),
        }
    }

    pub fn with_default_config(workers: Vec<WorkerId>) -> Self {
        Self::new(workers, EngineConfig::default())
    }

    /// Registers a freshly built Thunk in this Context's DAG, returning its id.
    pub fn register(&self, thunk: Thunk) -> ThunkId {
        let id = thunk.id;
        self.thunks.insert(id, Arc::new(thunk));
        id
    }

    pub fn thunk(&self, id: ThunkId) -> Option<Arc<Thunk>> {
        self.thunks.get(&id).map(|entry| entry.clone())
    }

    pub fn thunk_count(&self) -> usize {
        self.thunks.len()
    }
}

/// `stage(ctx, c)`: produce a Thunk (or chunk value) representing `c`,
/// without consulting the memoization cache. Most callers want
/// `cached_stage` instead; this is the per-variant staging contract (§4.1).
pub fn stage(ctx: &Context, c: &Computation) -> Result<Staged> {
    match c {
        Computation::Leaf(leaf) => {
            let id = leaf.stage(ctx)?;
            Ok(Staged::Thunk(id))
        }
        Computation::Tuple(cs) => {
            let mut inputs = Vec::with_capacity(cs.len());
            for sub in cs {
                inputs.push(cached_stage(ctx, sub)?.into_thunk_input());
            }
            let f: ThunkFn = Arc::new(|vals: &[TaskValue]| Ok(TaskValue::data(vals.to_vec())));
            let thunk = Thunk::new(f, inputs);
            let id = ctx.register(thunk);
            Ok(Staged::Thunk(id))
        }
        Computation::Cached(inner) => {
            let staged = cached_stage(ctx, inner)?;
            mark_persisted(ctx, &staged);
            Ok(staged)
        }
        Computation::Computed(chunk) => Ok(Staged::Chunk(AbstractChunk::Chunk(chunk.clone()))),
    }
}

fn mark_persisted(ctx: &Context, staged: &Staged) {
    match staged {
        Staged::Thunk(id) => {
            if let Some(thunk) = ctx.thunk(*id) {
                thunk.set_cache(true);
            }
        }
        Staged::Chunk(AbstractChunk::Chunk(mc)) => mc.mark_persisted(),
        Staged::Chunk(_) => {}
    }
}

/// `cached_stage(ctx, c)`: the memoized entry point. Consults the
/// per-Context weak-keyed mapping from Computation identity to staged
/// result; on hit, returns the existing node so equal sub-expressions
/// share nodes (the memoization invariant, §3/§8).
pub fn cached_stage(ctx: &Context, c: &Computation) -> Result<Staged> {
    let key = c.key();
    if let Some(existing) = ctx.comp_cache.get(&key) {
        debug!("stager cache hit");
        return Ok(existing.clone());
    }

    let staged = stage(ctx, c)?;
    ctx.comp_cache.insert(key, staged.clone());
    Ok(staged)
}

/// `thunkize(ctx, x)`: returns `x` unchanged for plain Chunks/Views and
/// already-resolved Cats. For a Cat with any pending cell, fuses the whole
/// grid into a single `meta=true` Thunk whose function receives the
/// per-cell results (in cell order) and rebuilds a resolved Cat preserving
/// the original domain, chunk layout, and chunk type (§4.1).
pub fn thunkize(ctx: &Context, x: AbstractChunk) -> Result<Staged> {
    if !x.is_deferred() {
        return Ok(Staged::Chunk(x));
    }

    let AbstractChunk::Cat { layout, cells } = x else {
        unreachable!("is_deferred() only returns true for Cat");
    };

    let inputs: Vec<ThunkInput> = cells
        .into_iter()
        .map(|cell| match cell {
            CatCell::Resolved(mc) => ThunkInput::Value(TaskValue::Chunk(AbstractChunk::Chunk(mc))),
            CatCell::Pending(id) => ThunkInput::Thunk(id),
        })
        .collect();

    let fused_layout = layout.clone();
    let f: ThunkFn = Arc::new(move |vals: &[TaskValue]| {
        let mut resolved = Vec::with_capacity(vals.len());
        for v in vals {
            match v {
                TaskValue::Chunk(AbstractChunk::Chunk(mc)) => {
                    resolved.push(CatCell::Resolved(mc.clone()))
                }
                other => {
                    return Err(EngineError::structural(format!(
                        "cat fusion expected a resolved chunk cell, got {:?}",
                        other
                    )))
                }
            }
        }
        Ok(TaskValue::Chunk(AbstractChunk::Cat {
            layout: fused_layout.clone(),
            cells: resolved,
        }))
    });

    let thunk = Thunk::new(f, inputs).with_meta(true);
    let id = ctx.register(thunk);
    Ok(Staged::Thunk(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{CatLayout, ChunkId, ChunkType, MaterializedChunk};
    use crate::computation::LeafStage;

    struct ConstLeaf {
        value: i64,
        invocations: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl LeafStage for ConstLeaf {
        fn stage(&self, ctx: &Context) -> Result<ThunkId> {
            let v = self.value;
            let counter = self.invocations.clone();
            let f: ThunkFn = Arc::new(move |_: &[TaskValue]| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(TaskValue::data(v))
            });
            Ok(ctx.register(Thunk::new(f, vec![])))
        }
    }

    #[test]
    fn cached_stage_memoizes_identical_computation() {
        let ctx = Context::with_default_config(vec![]);
        let leaf = Computation::leaf(ConstLeaf {
            value: 1,
            invocations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        });

        let a = cached_stage(&ctx, &leaf).unwrap();
        let b = cached_stage(&ctx, &leaf).unwrap();

        match (a, b) {
            (Staged::Thunk(id1), Staged::Thunk(id2)) => assert_eq!(id1, id2),
            _ => panic!("expected Thunk staging"),
        }
        assert_eq!(ctx.thunk_count(), 1);
    }

    #[test]
    fn distinct_leaves_stage_to_distinct_thunks() {
        let ctx = Context::with_default_config(vec![]);
        let a = Computation::leaf(ConstLeaf {
            value: 1,
            invocations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        });
        let b = Computation::leaf(ConstLeaf {
            value: 1,
            invocations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        });

        let sa = cached_stage(&ctx, &a).unwrap();
        let sb = cached_stage(&ctx, &b).unwrap();
        match (sa, sb) {
            (Staged::Thunk(id1), Staged::Thunk(id2)) => assert_ne!(id1, id2),
            _ => panic!("expected Thunk staging"),
        }
    }

    #[test]
    fn cached_marks_thunk_to_retain_result() {
        let ctx = Context::with_default_config(vec![]);
        let leaf = Computation::leaf(ConstLeaf {
            value: 1,
            invocations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
        .cached();

        let staged = cached_stage(&ctx, &leaf).unwrap();
        match staged {
            Staged::Thunk(id) => assert!(ctx.thunk(id).unwrap().is_cache()),
            _ => panic!("expected Thunk staging"),
        }
    }

    #[test]
    fn tuple_stages_each_child_and_shares_memoized_nodes() {
        let ctx = Context::with_default_config(vec![]);
        let leaf = Computation::leaf(ConstLeaf {
            value: 1,
            invocations: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        });
        let tuple = Computation::tuple(vec![leaf.clone(), leaf]);

        let staged = cached_stage(&ctx, &tuple).unwrap();
        assert!(matches!(staged, Staged::Thunk(_)));
        // One thunk for the shared leaf, one for the tuple wrapper.
        assert_eq!(ctx.thunk_count(), 2);
    }

    #[test]
    fn computed_stages_directly_to_a_chunk_value() {
        let ctx = Context::with_default_config(vec![]);
        let mc = Arc::new(MaterializedChunk::new(
            ChunkId(1),
            WorkerId("w1".into()),
            8,
            false,
        ));
        let computed = Computation::computed(mc);

        let staged = cached_stage(&ctx, &computed).unwrap();
        assert!(matches!(staged, Staged::Chunk(AbstractChunk::Chunk(_))));
        assert_eq!(ctx.thunk_count(), 0);
    }

    #[test]
    fn thunkize_passes_through_non_deferred_chunk() {
        let ctx = Context::with_default_config(vec![]);
        let mc = Arc::new(MaterializedChunk::new(
            ChunkId(1),
            WorkerId("w1".into()),
            8,
            false,
        ));
        let chunk = AbstractChunk::Chunk(mc);
        let staged = thunkize(&ctx, chunk).unwrap();
        assert!(matches!(staged, Staged::Chunk(AbstractChunk::Chunk(_))));
        assert_eq!(ctx.thunk_count(), 0);
    }

    #[test]
    fn thunkize_fuses_deferred_cat_into_single_meta_thunk() {
        let ctx = Context::with_default_config(vec![]);
        let resolved = Arc::new(MaterializedChunk::new(
            ChunkId(1),
            WorkerId("w1".into()),
            8,
            false,
        ));
        let pending_thunk = Thunk::new(Arc::new(|_: &[TaskValue]| Ok(TaskValue::data(0i32))), vec![]);
        let pending_id = ctx.register(pending_thunk);

        let layout = CatLayout {
            domain: vec![2],
            chunk_sizes: vec![1],
            chunk_type: ChunkType("bytes".into()),
        };
        let cat = AbstractChunk::Cat {
            layout,
            cells: vec![CatCell::Resolved(resolved), CatCell::Pending(pending_id)],
        };

        let staged = thunkize(&ctx, cat).unwrap();
        match staged {
            Staged::Thunk(id) => {
                let fused = ctx.thunk(id).unwrap();
                assert!(fused.meta);
                assert_eq!(fused.inputs.len(), 2);
            }
            _ => panic!("expected fused Thunk"),
        }
    }
}

//! The scheduler state machine (§4.3): ready/waiting/running bookkeeping,
//! the dispatch loop, the cache-hit short-circuit, and inline meta-task
//! execution. Grounded on the teacher's `run_dag`/`execute_stage` pair
//! (orchestrator.rs) — `tokio::spawn` per unit of work, a single await
//! point collecting results — generalized from phase-barriered
//! `join_all` to a single completion channel, since here dispatch is
//! dynamic (a finished Thunk can unlock work immediately) rather than
//! phase-barriered.

use crate::affinity::{select_for_worker, thunk_affinity};
use crate::chunk::{AbstractChunk, ChunkId, WorkerId};
use crate::error::{EngineError, Result};
use crate::graph::{self, Node};
use crate::lifetime;
use crate::stager::Context;
use crate::thunk::{CacheRef, TaskValue, ThunkId, ThunkInput};
use crate::worker::{async_apply, Completion, TaskOutcome, WorkerPool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info_span;

struct SchedulerState {
    dependents: HashMap<Node, HashSet<Node>>,
    waiting: HashMap<ThunkId, HashSet<ThunkId>>,
    waiting_data: HashMap<Node, HashSet<Node>>,
    ready: Vec<ThunkId>,
    /// Thunks currently dispatched, keyed to the worker they were handed to
    /// so `dispatch_cycle` can tell a busy worker from an idle one — the
    /// `|running| < |workers|` invariant (§4.3/§5) is per-worker, not just
    /// a global count.
    running: HashMap<ThunkId, WorkerId>,
    busy_workers: HashSet<WorkerId>,
    cache: HashMap<ThunkId, TaskValue>,
    resolved_affinity: HashMap<ThunkId, Vec<(WorkerId, u32)>>,
    /// The Context's persistent live-worker set — the orphan-detection
    /// baseline `select_for_worker` compares affinity against (§4.4 point 2).
    /// Never mutated after `new`: a worker idling for lack of an eligible
    /// task is a per-`dispatch_cycle` condition (§4.3 step 4), not a
    /// permanent exclusion, so that bookkeeping lives in a scratch set local
    /// to each `dispatch_cycle` call instead of here.
    live_workers: HashSet<WorkerId>,
}

fn value_affinity(value: &TaskValue) -> Vec<(WorkerId, u32)> {
    match value {
        TaskValue::Chunk(c) => c.owning_workers().into_iter().map(|w| (w, 1)).collect(),
        TaskValue::Data(_) => Vec::new(),
    }
}

fn chunk_id_of(value: &TaskValue) -> Option<ChunkId> {
    match value {
        TaskValue::Chunk(AbstractChunk::Chunk(mc)) => Some(mc.id),
        _ => None,
    }
}

impl SchedulerState {
    fn new(ctx: &Context, root: ThunkId, pool: &dyn WorkerPool) -> Self {
        let analysis = graph::analyze(ctx, root);
        let dependents = analysis.dependents;
        let waiting_data = dependents.clone();

        let mut waiting = HashMap::new();
        let mut ready = Vec::new();
        for node in dependents.keys() {
            if let Node::Thunk(id) = node {
                let deps: HashSet<ThunkId> = ctx
                    .thunk(*id)
                    .map(|t| t.thunk_inputs().collect())
                    .unwrap_or_default();
                if deps.is_empty() {
                    ready.push(*id);
                } else {
                    waiting.insert(*id, deps);
                }
            }
        }

        Self {
            dependents,
            waiting,
            waiting_data,
            ready,
            running: HashMap::new(),
            busy_workers: HashSet::new(),
            cache: HashMap::new(),
            resolved_affinity: HashMap::new(),
            live_workers: pool.workers().into_iter().collect(),
        }
    }

    fn gather_inputs(&self, ctx: &Context, id: ThunkId) -> Result<Vec<TaskValue>> {
        let thunk = ctx
            .thunk(id)
            .ok_or_else(|| EngineError::structural(format!("thunk {} not registered", id)))?;
        thunk
            .inputs
            .iter()
            .map(|input| match input {
                ThunkInput::Value(v) => Ok(v.clone()),
                ThunkInput::Thunk(dep) => self.cache.get(dep).cloned().ok_or_else(|| {
                    EngineError::structural(format!(
                        "thunk {} fired with unresolved input {}",
                        id, dep
                    ))
                }),
            })
            .collect()
    }

    fn record_result(&mut self, thunk_id: ThunkId, value: TaskValue) {
        self.resolved_affinity.insert(thunk_id, value_affinity(&value));
        self.cache.insert(thunk_id, value);
    }

    /// `finish_task` (§4.3 step 3): unlocks dependents, frees inputs whose
    /// last consumer has fired, and returns the fast-path child if exactly
    /// one successor was unlocked by this completion.
    async fn finish_task(
        &mut self,
        ctx: &Context,
        pool: &dyn WorkerPool,
        node: ThunkId,
    ) -> Result<Option<ThunkId>> {
        let mut immediate_next = None;
        if let Some(dependents) = self.dependents.get(&Node::Thunk(node)).cloned() {
            for dependent in dependents {
                if let Node::Thunk(d) = dependent {
                    if let Some(set) = self.waiting.get_mut(&d) {
                        set.remove(&node);
                        if set.is_empty() {
                            self.waiting.remove(&d);
                            self.ready.push(d);
                            immediate_next = Some(d);
                        }
                    }
                }
            }
        }

        let thunk = ctx
            .thunk(node)
            .ok_or_else(|| EngineError::structural(format!("thunk {} not registered", node)))?;

        for (i, input) in thunk.inputs.iter().enumerate() {
            let input_node = match input {
                ThunkInput::Thunk(dep) => Node::Thunk(*dep),
                ThunkInput::Value(_) => Node::Leaf(node, i),
            };

            let now_empty = match self.waiting_data.get_mut(&input_node) {
                Some(set) => {
                    set.remove(&Node::Thunk(node));
                    set.is_empty()
                }
                None => false,
            };
            if !now_empty {
                continue;
            }

            match input_node {
                Node::Thunk(input_id) => {
                    let retained = ctx.thunk(input_id).map(|t| t.is_cache()).unwrap_or(false);
                    if retained {
                        continue;
                    }
                    if let Some(TaskValue::Chunk(chunk)) = self.cache.get(&input_id) {
                        lifetime::free(pool, chunk, false, false).await;
                    }
                    self.cache.remove(&input_id);
                }
                Node::Leaf(_, _) => {
                    if let ThunkInput::Value(TaskValue::Chunk(chunk)) = input {
                        lifetime::free(pool, chunk, false, false).await;
                    }
                }
            }
        }

        if let Some(worker) = self.running.remove(&node) {
            self.busy_workers.remove(&worker);
        }
        Ok(immediate_next)
    }

    fn affinity_of(&self, ctx: &Context, id: ThunkId) -> Vec<(WorkerId, u32)> {
        thunk_affinity(ctx, &self.resolved_affinity, id)
    }
}

/// Runs the scheduler to completion and returns the target Thunk's result.
pub async fn run(ctx: &Context, pool: Arc<dyn WorkerPool>, root: ThunkId) -> Result<TaskValue> {
    let _span = info_span!("scheduler", root = %root).entered();
    let mut state = {
        let _init = info_span!("scheduler_init", root = %root).entered();
        SchedulerState::new(ctx, root, pool.as_ref())
    };
    let (tx, mut rx) = mpsc::channel::<Completion>(ctx.config.completion_channel_capacity);

    let mut fast_path = run_inline_meta(ctx, pool.as_ref(), &mut state).await?;

    loop {
        if state.waiting.is_empty() && state.ready.is_empty() && state.running.is_empty() {
            break;
        }

        dispatch_cycle(ctx, &pool, &mut state, &tx, fast_path.take()).await?;

        if state.running.is_empty() {
            if state.ready.is_empty() && state.waiting.is_empty() {
                break;
            }
            return Err(EngineError::structural(
                "scheduler stalled: work remains but no task is running or dispatchable",
            ));
        }

        let completion = rx.recv().await.ok_or_else(|| EngineError::ChannelClosed {
            outstanding: state.running.len(),
        })?;

        match completion.outcome {
            TaskOutcome::Failed(e) => return Err(e),
            TaskOutcome::Success(value) => {
                state.record_result(completion.thunk_id, value);
                if let Some(thunk) = ctx.thunk(completion.thunk_id) {
                    if thunk.is_cache() {
                        if let Some(v) = state.cache.get(&completion.thunk_id) {
                            *thunk.cache_ref.lock().unwrap() = Some(CacheRef {
                                worker: completion.worker,
                                value: v.clone(),
                            });
                        }
                    }
                }

                let immediate_next = state
                    .finish_task(ctx, pool.as_ref(), completion.thunk_id)
                    .await?;
                let meta_next = run_inline_meta(ctx, pool.as_ref(), &mut state).await?;
                fast_path = meta_next.or(immediate_next);
            }
        }
    }

    state.cache.remove(&root).ok_or_else(|| {
        EngineError::structural("scheduler finished without a result for the root thunk")
    })
}

/// Repeatedly pulls `meta=true` Thunks out of `ready` and executes them
/// inline on the master (§4.3 "Meta tasks"), since they run with inputs
/// unmoved and complete without a channel round-trip. Returns the last
/// fast-path child unlocked, if any, as a hint for the next dispatch cycle.
async fn run_inline_meta(
    ctx: &Context,
    pool: &dyn WorkerPool,
    state: &mut SchedulerState,
) -> Result<Option<ThunkId>> {
    let mut last_unlocked = None;
    loop {
        let meta_idx = state
            .ready
            .iter()
            .position(|id| ctx.thunk(*id).map(|t| t.meta).unwrap_or(false));
        let Some(idx) = meta_idx else {
            return Ok(last_unlocked);
        };
        let thunk_id = state.ready.remove(idx);
        let thunk = ctx
            .thunk(thunk_id)
            .ok_or_else(|| EngineError::structural(format!("thunk {} not registered", thunk_id)))?;

        let inputs = state.gather_inputs(ctx, thunk_id)?;
        let value = (thunk.f)(&inputs).map_err(|e| EngineError::Computation {
            worker: "master".to_string(),
            message: e.to_string(),
        })?;

        state.record_result(thunk_id, value);
        last_unlocked = state.finish_task(ctx, pool, thunk_id).await?.or(last_unlocked);
    }
}

/// Seeds/re-dispatches: for each live worker with spare capacity, assign it
/// a task per §4.3 step 1/4. `fast_path`, when set, is taken immediately by
/// the first worker with capacity, bypassing affinity.
///
/// A worker with no eligible task is dropped only from `cycle_workers`, a
/// scratch set seeded fresh from `state.live_workers` at the top of this
/// call — it must not idle that worker out of `state.live_workers` itself,
/// since that set is also the orphan-detection baseline `select_for_worker`
/// compares every other candidate's affinity against, and a run-long
/// exclusion would be a structural change the spec doesn't call for.
async fn dispatch_cycle(
    ctx: &Context,
    pool: &Arc<dyn WorkerPool>,
    state: &mut SchedulerState,
    tx: &mpsc::Sender<Completion>,
    mut fast_path: Option<ThunkId>,
) -> Result<()> {
    let mut cycle_workers: HashSet<WorkerId> = state.live_workers.clone();
    let workers: Vec<WorkerId> = cycle_workers.iter().cloned().collect();
    for worker in workers {
        if state.ready.is_empty() {
            break;
        }
        if state.running.len() >= ctx.config.max_concurrent_tasks {
            break;
        }
        if state.busy_workers.contains(&worker) || !cycle_workers.contains(&worker) {
            continue;
        }

        let chosen = if let Some(fast_id) = fast_path.take() {
            state.ready.iter().position(|id| *id == fast_id)
        } else {
            let affinities: HashMap<ThunkId, Vec<(WorkerId, u32)>> = state
                .ready
                .iter()
                .map(|id| (*id, state.affinity_of(ctx, *id)))
                .collect();
            select_for_worker(&state.ready, &affinities, &state.live_workers, &worker)
        };

        let Some(idx) = chosen else {
            cycle_workers.remove(&worker);
            continue;
        };

        let thunk_id = state.ready.remove(idx);
        dispatch_one(ctx, pool, state, tx, worker, thunk_id).await?;
    }
    Ok(())
}

async fn dispatch_one(
    ctx: &Context,
    pool: &Arc<dyn WorkerPool>,
    state: &mut SchedulerState,
    tx: &mpsc::Sender<Completion>,
    worker: WorkerId,
    thunk_id: ThunkId,
) -> Result<()> {
    let thunk = ctx
        .thunk(thunk_id)
        .ok_or_else(|| EngineError::structural(format!("thunk {} not registered", thunk_id)))?;

    // Cache-hit short-circuit (§4.3): ask the worker holding the cached
    // datum to confirm liveness. On success, feed the result through the
    // same completion channel a normal dispatch would use, so the main
    // loop's finish_task/re-dispatch logic handles both paths identically.
    if thunk.is_cache() {
        let cached_ref = thunk.cache_ref.lock().unwrap().clone();
        if let Some(cache_ref) = cached_ref {
            let chunk_id = chunk_id_of(&cache_ref.value);
            let still_live = match chunk_id {
                Some(id) => pool.unrelease(&cache_ref.worker, id).await?,
                None => Some(cache_ref.value.clone()),
            };
            if let Some(value) = still_live {
                state.running.insert(thunk_id, worker.clone());
                state.busy_workers.insert(worker.clone());
                let _ = tx
                    .send(Completion {
                        worker: cache_ref.worker,
                        thunk_id,
                        outcome: TaskOutcome::Success(value),
                    })
                    .await;
                return Ok(());
            }
            *thunk.cache_ref.lock().unwrap() = None;
        }
    }

    let inputs = state.gather_inputs(ctx, thunk_id)?;
    state.running.insert(thunk_id, worker.clone());
    state.busy_workers.insert(worker.clone());
    async_apply(
        pool.clone(),
        worker,
        thunk_id,
        thunk.f.clone(),
        inputs,
        thunk.get_result,
        thunk.is_persist(),
        ctx.config.task_timeout_ms,
        tx.clone(),
    );
    Ok(())
}

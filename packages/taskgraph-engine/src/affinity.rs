//! Affinity-aware worker selection (§4.4). Given the current `ready` list
//! and a candidate worker, picks the best-matching task by scanning from
//! most-recently-added to oldest.

use crate::chunk::WorkerId;
use crate::stager::Context;
use crate::thunk::ThunkId;
use std::collections::HashSet;

/// Affinity of a Thunk: the concatenation of affinities of its inputs.
/// Thunk-valued inputs contribute through their resolved cache value, so
/// the scheduler passes in the already-resolved affinity list rather than
/// recomputing it from `Thunk::static_affinity` alone.
pub fn thunk_affinity(ctx: &Context, resolved: &std::collections::HashMap<ThunkId, Vec<(WorkerId, u32)>>, id: ThunkId) -> Vec<(WorkerId, u32)> {
    let Some(thunk) = ctx.thunk(id) else {
        return Vec::new();
    };
    let mut affinity = thunk.static_affinity();
    for input in thunk.thunk_inputs() {
        if let Some(a) = resolved.get(&input) {
            affinity.extend(a.iter().cloned());
        }
    }
    affinity
}

/// Picks the best task in `ready` for worker `p` (§4.4):
/// 1. First pass (reverse iteration): the most-recently-added Thunk for
///    which `p` appears in its affinity set.
/// 2. Second pass: the most-recently-added Thunk that either has no
///    affinity at all, or whose affinity matches no currently-live worker
///    (it's orphaned and must run somewhere).
/// 3. Otherwise `None` — `p` should idle this cycle.
///
/// Returns the index into `ready` of the chosen task, so the caller can
/// remove it in place.
pub fn select_for_worker(
    ready: &[ThunkId],
    affinities: &std::collections::HashMap<ThunkId, Vec<(WorkerId, u32)>>,
    live_workers: &HashSet<WorkerId>,
    p: &WorkerId,
) -> Option<usize> {
    for (idx, thunk_id) in ready.iter().enumerate().rev() {
        let affinity = affinities.get(thunk_id);
        if let Some(affinity) = affinity {
            if affinity.iter().any(|(w, _)| w == p) {
                return Some(idx);
            }
        }
    }

    for (idx, thunk_id) in ready.iter().enumerate().rev() {
        match affinities.get(thunk_id) {
            None => return Some(idx),
            Some(affinity) if affinity.is_empty() => return Some(idx),
            Some(affinity) => {
                let orphaned = affinity.iter().all(|(w, _)| !live_workers.contains(w));
                if orphaned {
                    return Some(idx);
                }
            }
        }
    }

    None
}

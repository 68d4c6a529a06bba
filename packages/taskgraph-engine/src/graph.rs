//! DAG-shape derivations rooted at a target Thunk (§4.2): dependents,
//! offspring counts, and a priority-friendly total order. Grounded on the
//! teacher's reverse-dependency index + BFS propagation, generalized from
//! file-import edges to Thunk-input edges.

use crate::stager::Context;
use crate::thunk::ThunkId;
use std::collections::{HashMap, HashSet, VecDeque};

/// A node in the analyzed graph: either a Thunk, or one of its non-Thunk
/// ("leaf") inputs. Leaves get dependents entries too (§4.2 point 1) so the
/// reference counter can track their consumers even though they have no
/// Thunk identity of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Thunk(ThunkId),
    Leaf(ThunkId, usize),
}

/// The three derivations of §4.2, computed once per run against the DAG
/// rooted at the target Thunk.
pub struct GraphAnalysis {
    pub dependents: HashMap<Node, HashSet<Node>>,
    pub offspring: HashMap<Node, usize>,
    /// node -> position in the DFS pre-order (smaller = closer to root).
    pub order: HashMap<Node, usize>,
}

impl GraphAnalysis {
    /// Priority for dispatch tie-breaking: higher priority is closer to the
    /// root (§4.2: "priority = -order[n]").
    pub fn priority(&self, node: Node) -> i64 {
        -(self.order.get(&node).copied().unwrap_or(0) as i64)
    }
}

fn thunk_node_inputs(ctx: &Context, id: ThunkId) -> Vec<Node> {
    let Some(thunk) = ctx.thunk(id) else {
        return Vec::new();
    };
    thunk
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| match input {
            crate::thunk::ThunkInput::Thunk(dep) => Node::Thunk(*dep),
            crate::thunk::ThunkInput::Value(_) => Node::Leaf(id, i),
        })
        .collect()
}

/// Computes the dependents map by a recursive (here: worklist-based)
/// traversal starting from `root` — for every edge `parent -> child`
/// discovered, `child` gains `parent` as a dependent.
fn compute_dependents(ctx: &Context, root: ThunkId) -> HashMap<Node, HashSet<Node>> {
    let mut dependents: HashMap<Node, HashSet<Node>> = HashMap::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(root);
    seen.insert(root);

    while let Some(current) = queue.pop_front() {
        let parent = Node::Thunk(current);
        dependents.entry(parent).or_default();
        for child in thunk_node_inputs(ctx, current) {
            dependents.entry(child).or_default().insert(parent);
            if let Node::Thunk(child_id) = child {
                if seen.insert(child_id) {
                    queue.push_back(child_id);
                }
            }
        }
    }

    dependents
}

/// Offspring count: total number of transitively dependent nodes, i.e. the
/// size of the reachable set walking from each node through `dependents`
/// edges in reverse (from a node to the things that depend on it, which is
/// the same map we already built — walking it forward from the node itself
/// reaches every transitive consumer).
fn compute_offspring(dependents: &HashMap<Node, HashSet<Node>>) -> HashMap<Node, usize> {
    let mut offspring = HashMap::new();
    for &node in dependents.keys() {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(node);
        while let Some(current) = queue.pop_front() {
            if let Some(consumers) = dependents.get(&current) {
                for &consumer in consumers {
                    if visited.insert(consumer) {
                        queue.push_back(consumer);
                    }
                }
            }
        }
        offspring.insert(node, visited.len());
    }
    offspring
}

/// DFS pre-order from `root`, visiting children (Thunk-inputs) sorted by
/// ascending offspring count at each step (§4.2 point 3).
fn compute_order(
    ctx: &Context,
    root: ThunkId,
    offspring: &HashMap<Node, usize>,
) -> HashMap<Node, usize> {
    let mut order = HashMap::new();
    let mut visited = HashSet::new();

    // Explicit stack (not recursion) for pre-order DFS; children are pushed
    // in descending offspring order so the ascending child is popped (and
    // thus visited) first.
    let mut next_index = 0usize;
    let mut work = vec![root];
    visited.insert(Node::Thunk(root));

    while let Some(current) = work.pop() {
        let node = Node::Thunk(current);
        order.insert(node, next_index);
        next_index += 1;

        let mut children = thunk_node_inputs(ctx, current);
        // Sort descending and push in that order, so the smallest-offspring
        // child ends up last pushed (top of stack) and is popped first.
        children.sort_by_key(|c| std::cmp::Reverse(offspring.get(c).copied().unwrap_or(0)));

        for child in children.into_iter() {
            if visited.insert(child) {
                if let Node::Thunk(child_id) = child {
                    work.push(child_id);
                } else {
                    order.insert(child, next_index);
                    next_index += 1;
                }
            }
        }
    }

    order
}

pub fn analyze(ctx: &Context, root: ThunkId) -> GraphAnalysis {
    let dependents = compute_dependents(ctx, root);
    let offspring = compute_offspring(&dependents);
    let order = compute_order(ctx, root, &offspring);
    GraphAnalysis {
        dependents,
        offspring,
        order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::thunk::{TaskValue, Thunk, ThunkInput};
    use std::sync::Arc;

    fn identity_fn() -> crate::thunk::ThunkFn {
        Arc::new(|inputs: &[TaskValue]| Ok(inputs[0].clone()))
    }

    /// Builds a diamond: root depends on b and c, both depend on leaf.
    fn diamond(ctx: &Context) -> ThunkId {
        let leaf = ctx.register(Thunk::new(identity_fn(), vec![]));
        let b = ctx.register(Thunk::new(identity_fn(), vec![ThunkInput::Thunk(leaf)]));
        let c = ctx.register(Thunk::new(identity_fn(), vec![ThunkInput::Thunk(leaf)]));
        ctx.register(Thunk::new(
            identity_fn(),
            vec![ThunkInput::Thunk(b), ThunkInput::Thunk(c)],
        ))
    }

    #[test]
    fn dependents_map_covers_every_reachable_node() {
        let ctx = Context::new(vec![], EngineConfig::default());
        let root = diamond(&ctx);
        let analysis = analyze(&ctx, root);
        assert_eq!(analysis.dependents.len(), 4);
    }

    #[test]
    fn shared_leaf_has_two_dependents() {
        let ctx = Context::new(vec![], EngineConfig::default());
        let root = diamond(&ctx);
        let analysis = analyze(&ctx, root);
        let leaf_node = analysis
            .dependents
            .keys()
            .find(|n| matches!(n, Node::Thunk(id) if ctx.thunk(*id).unwrap().inputs.is_empty()))
            .copied()
            .unwrap();
        assert_eq!(analysis.dependents[&leaf_node].len(), 2);
    }

    #[test]
    fn root_has_no_offspring_and_leaf_has_the_most() {
        let ctx = Context::new(vec![], EngineConfig::default());
        let root = diamond(&ctx);
        let analysis = analyze(&ctx, root);
        let root_offspring = analysis.offspring[&Node::Thunk(root)];
        assert_eq!(root_offspring, 0);
        let leaf_node = analysis
            .dependents
            .keys()
            .find(|n| matches!(n, Node::Thunk(id) if ctx.thunk(*id).unwrap().inputs.is_empty()))
            .copied()
            .unwrap();
        assert_eq!(analysis.offspring[&leaf_node], 3);
    }

    #[test]
    fn root_sorts_first_in_total_order() {
        let ctx = Context::new(vec![], EngineConfig::default());
        let root = diamond(&ctx);
        let analysis = analyze(&ctx, root);
        assert_eq!(analysis.order[&Node::Thunk(root)], 0);
        assert_eq!(analysis.priority(Node::Thunk(root)), 0);
    }
}

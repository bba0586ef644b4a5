use rustc_hash::{FxHashMap, FxHashSet};

/// Post-dominator sets over the static basic-block graph.
///
/// `pdom(b)` holds every block that lies on all paths from `b` to an
/// exit. Exit blocks (no successors) post-dominate only themselves; for
/// the rest the fixed point of
/// `pdom(b) = {b} ∪ ⋂ pdom(s) over successors s` is computed, starting
/// from each block's forward-reachable set. The liveness pass consults
/// this to suppress control-dependence edges onto successors that are
/// reached unconditionally.
pub fn build_post_dominators(
    successors: &FxHashMap<u32, Vec<u32>>,
) -> FxHashMap<u32, FxHashSet<u32>> {
    let mut nodes: FxHashSet<u32> = FxHashSet::default();
    for (&from, to) in successors {
        nodes.insert(from);
        nodes.extend(to.iter().copied());
    }

    // Initialize with forward reachability (every node reaches itself).
    let mut pdom: FxHashMap<u32, FxHashSet<u32>> = FxHashMap::default();
    for &node in &nodes {
        let mut reached = FxHashSet::default();
        let mut stack = vec![node];
        while let Some(bb) = stack.pop() {
            if !reached.insert(bb) {
                continue;
            }
            if let Some(next) = successors.get(&bb) {
                stack.extend(next.iter().copied());
            }
        }
        pdom.insert(node, reached);
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &node in &nodes {
            let Some(succ) = successors.get(&node).filter(|s| !s.is_empty()) else {
                // An exit block post-dominates only itself.
                let current = pdom.get_mut(&node).expect("initialized above");
                if current.len() != 1 {
                    current.clear();
                    current.insert(node);
                    changed = true;
                }
                continue;
            };

            let mut next: FxHashSet<u32> = pdom[&succ[0]].clone();
            for s in &succ[1..] {
                let other = &pdom[s];
                next.retain(|bb| other.contains(bb));
            }
            next.insert(node);

            if next != pdom[&node] {
                pdom.insert(node, next);
                changed = true;
            }
        }
    }

    pdom
}

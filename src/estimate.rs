use crate::log::LogLevel;
use crate::tree::{NodeId, Tree};

/// Result of one estimation pass, for the Estimate message.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EstimateResult {
    /// Fraction of the whole tree the explored branches represent.
    pub proportion: f64,
    pub estimated_branches: u64,
    pub estimated_total_usecs: f64,
}

/// Updates the per-node proportions for the branch that just ended at
/// `leaf`, retroactively fixing up ancestors whose marked-children counts
/// changed since the last branch, and returns the new root estimate.
///
/// The leaf weight is 1 / product(marked children) along the path; a
/// node's proportion accumulates the weights of the leaves below it.
pub fn estimate(
    tree: &mut Tree,
    root: NodeId,
    leaf: NodeId,
    branches_explored: u64,
    elapsed_usecs: u64,
) -> EstimateResult {
    {
        let leaf_node = tree.node_mut(leaf);
        if leaf_node.estimate_computed {
            log!(LogLevel::LogWarn, "estimate recomputed on leaf {:?}", leaf);
        }
        leaf_node.estimate_computed = true;
    }

    let mut this_branch_proportion = 1.0f64;
    // when a node's probability changes retroactively, its parent must see
    // the difference too
    let mut node_delta = 0.0f64;

    let path = tree.path_from_root(leaf);
    // walk leaf-to-root, skipping the leaf itself
    for &id in path.iter().rev().skip(1) {
        if tree.node(id).parent.is_none() {
            assert_eq!(id, root);
        }

        let marked = {
            let node = tree.node(id);
            let runnable = node.snapshot.sched.runnable_tids();
            runnable
                .iter()
                .filter(|&&tid| node.is_marked(tree, tid))
                .count() as u64
        };

        let node = tree.node_mut(id);
        node.marked_children_old = node.marked_children;
        node.marked_children = marked;
        // the branch we just finished came through here
        assert!(node.marked_children > 0);

        this_branch_proportion /= node.marked_children as f64;

        let old_proportion = node.proportion;
        // adjust by the child's delta before rescaling, so the rescale
        // covers it too
        node.proportion += node_delta;
        if node.marked_children_old > 0 {
            node.proportion *= node.marked_children_old as f64;
            node.proportion /= node.marked_children as f64;
        }
        node_delta = node.proportion - old_proportion;
    }

    // add this branch's weight, and its cost, to every node on the path
    let branch_usecs: u64 = path.iter().map(|&id| tree.node(id).usecs).sum();
    for &id in path.iter() {
        let node = tree.node_mut(id);
        node.proportion += this_branch_proportion;
        node.subtree_usecs += branch_usecs as f64;
    }

    let proportion = tree.node(root).proportion;
    log!(LogLevel::LogDebug, "estimate: {}", proportion);

    let estimated_branches = if proportion > 0.0 {
        (branches_explored as f64 / proportion).round() as u64
    } else {
        branches_explored
    };
    let estimated_total_usecs = if proportion > 0.0 {
        elapsed_usecs as f64 / proportion
    } else {
        elapsed_usecs as f64
    };

    EstimateResult {
        proportion,
        estimated_branches,
        estimated_total_usecs,
    }
}

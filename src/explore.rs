use crate::log::LogLevel;
use crate::tree::{NodeId, Tree};
use crate::vector_clock::Tid;

enum TagScan {
    /// A tagged sibling with no branch through it yet.
    Pick(Tid),
    /// Every tagged sibling has a child, but some subtree is still being
    /// worked on; this node must not be marked done yet.
    InProgress,
    Satisfied,
}

fn scan_tags(tree: &Tree, id: NodeId) -> TagScan {
    let node = tree.node(id);
    let mut in_progress = false;
    for tid in node.tagged.iter() {
        match tree.child_with_choice(id, *tid) {
            None => return TagScan::Pick(*tid),
            Some(child) => {
                if !tree.node(child).all_explored {
                    in_progress = true;
                }
            }
        }
    }
    if in_progress {
        TagScan::InProgress
    } else {
        TagScan::Satisfied
    }
}

fn subtree_done(tree: &Tree, id: NodeId) -> bool {
    let node = tree.node(id);
    node.children
        .iter()
        .all(|&child| tree.node(child).all_explored)
}

/// Walks up from the just-finished leaf looking for the most recent
/// ancestor with a tagged-but-unexplored sibling, updating all_explored
/// bits on the way. None means the root is all explored and the state
/// space is exhausted.
pub fn explore(tree: &mut Tree, current: NodeId) -> Option<(NodeId, Tid)> {
    let mut at = current;
    // cycle check: the rabbit walks twice as fast
    let mut rabbit = Some(current);

    loop {
        if !tree.node(at).all_explored {
            let scan = if tree.node(at).is_preemption_point {
                scan_tags(tree, at)
            } else {
                TagScan::Satisfied
            };
            match scan {
                TagScan::Pick(tid) => {
                    log!(
                        LogLevel::LogDebug,
                        "chose tid {} from node {:?} (tid {:?})",
                        tid,
                        at,
                        tree.node(at).chosen_thread
                    );
                    return Some((at, tid));
                }
                TagScan::InProgress => {}
                TagScan::Satisfied => {
                    if subtree_done(tree, at) {
                        log!(
                            LogLevel::LogDebug,
                            "node {:?} (tid {:?}) all_explored",
                            at,
                            tree.node(at).chosen_thread
                        );
                        tree.node_mut(at).all_explored = true;
                    }
                }
            }
        }

        match tree.node(at).parent {
            Some(parent) => at = parent,
            None => {
                log!(LogLevel::LogInfo, "root of tree all explored");
                return None;
            }
        }
        rabbit = rabbit.and_then(|r| tree.node(r).parent);
        rabbit = rabbit.and_then(|r| tree.node(r).parent);
        if rabbit == Some(at) {
            fatal!("choice tree has a cycle");
        }
    }
}

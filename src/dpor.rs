use crate::log::LogLevel;
use crate::memory::{ChunkIdInfo, DataRaceTable, MemState};
use crate::messaging::{JobChannel, OutputMessage};
use crate::profile::GuestProfile;
use crate::tree::{NodeId, Tree};
use crate::vector_clock::Tid;

/// One end of a suspected data race, in a reportable form.
#[derive(Clone, Debug)]
struct RaceSide {
    eip: u32,
    tid: Tid,
    last_call: u32,
    most_recent_syscall: u32,
}

#[derive(Clone, Debug)]
struct RaceObservation {
    /// The access in the newer transition.
    later: RaceSide,
    /// The access in the ancestor transition.
    earlier: RaceSide,
    confirmed: bool,
    too_suspicious: bool,
    /// Parent of the ancestor node, checked for a matching speculative PP.
    enable_speculative: Option<(NodeId, u32)>,
}

fn tested_mem<'t>(tree: &'t Tree, id: NodeId, profile: &dyn GuestProfile) -> &'t MemState {
    let snapshot = &tree.node(id).snapshot;
    if profile.testing_userspace() {
        &snapshot.user_mem
    } else {
        &snapshot.kern_mem
    }
}

/// Intersects the shared-memory footprints of the transitions ending at
/// `new_id` and `anc_id`. Returns whether they conflict, whether a chunk
/// changed identity between them (a free/realloc slipped in between), and
/// the data-race pairs found along the way.
fn shm_intersect(
    tree: &Tree,
    races: &mut DataRaceTable,
    profile: &dyn GuestProfile,
    new_id: NodeId,
    anc_id: NodeId,
    record_races: bool,
) -> (bool, bool, Vec<RaceObservation>) {
    let m0 = tested_mem(tree, new_id, profile);
    let m1 = tested_mem(tree, anc_id, profile);
    let tid0 = tree.node(new_id).chosen_thread.unwrap();
    let tid1 = tree.node(anc_id).chosen_thread.unwrap();

    let mut conflict = false;
    let mut chunk_changed = false;
    let mut observations = Vec::new();

    for (addr, ma0) in m0.shm.iter() {
        // an access in one transition to memory the other freed always
        // conflicts, even with no matching access record
        if m1.freed.containing(*addr).is_some() {
            log!(
                LogLevel::LogDebug,
                "conflict: [{:#x} {}{} (tid{} freed)]",
                addr,
                if ma0.any_writes { 'w' } else { 'r' },
                ma0.count,
                tid1
            );
            conflict = true;
            chunk_changed = true;
        }

        let ma1 = match m1.shm.get(addr) {
            Some(ma1) => ma1,
            None => continue,
        };
        if !(ma0.any_writes || ma1.any_writes) {
            continue;
        }

        // Each distinct eip pair matters: one pair being unreorderable
        // doesn't make another pair at the same address innocent.
        for l0 in ma0.locksets.iter() {
            for l1 in ma1.locksets.iter() {
                if !(l0.write || l1.write) {
                    continue;
                }
                if l0.locks_held.intersects(&l1.locks_held) {
                    continue;
                }
                if !(l0.interrupts_enabled || l1.interrupts_enabled) {
                    continue;
                }
                if profile.ignore_dr_function(l0.eip) || profile.ignore_dr_function(l1.eip) {
                    continue;
                }
                conflict = true;

                if ChunkIdInfo::chunk_changed(l0.chunk_ids, l1.chunk_ids) {
                    // same address, different allocation: order the
                    // alloc against the free instead of reporting a race
                    chunk_changed = true;
                    continue;
                }

                if profile.testing_userspace() && profile.kernel_memory(*addr) {
                    // recorded via a user-backchannel syscall; we don't
                    // track kernel mutexes here, so no race verdicts
                    continue;
                }
                if !record_races {
                    continue;
                }

                // earlier access executed first: ancestor's side
                let confirmed = races.record(l1.eip, l0.eip);
                observations.push(RaceObservation {
                    later: RaceSide {
                        eip: l0.eip,
                        tid: tid0,
                        last_call: l0.last_call,
                        most_recent_syscall: l0.most_recent_syscall,
                    },
                    earlier: RaceSide {
                        eip: l1.eip,
                        tid: tid1,
                        last_call: l1.last_call,
                        most_recent_syscall: l1.most_recent_syscall,
                    },
                    confirmed,
                    too_suspicious: l0.during_destroy || l1.during_init,
                    enable_speculative: tree.node(anc_id).parent.map(|p| (p, l1.eip)),
                });
            }
        }
    }

    // also conflicts: the ancestor touched memory the new transition freed
    for (addr, _ma1) in m1.shm.iter() {
        if m0.freed.containing(*addr).is_some() {
            conflict = true;
            chunk_changed = true;
        }
    }

    (conflict, chunk_changed, observations)
}

/// Finds where to preempt so the newer transition's thread runs before the
/// conflicting ancestor transition: the pre-state of that transition, or
/// the nearest earlier point where the thread was runnable. Returns the
/// node to tag, or None with `tag_all` semantics if the thread was never
/// runnable there.
fn find_reorder_point(tree: &Tree, path: &[NodeId], anc_depth: u32, tid: Tid) -> Option<NodeId> {
    for k in (0..anc_depth).rev() {
        let h_k = path[k as usize];
        let chosen_after = tree.node(path[k as usize + 1]).chosen_thread;
        if chosen_after == Some(tid) {
            continue;
        }
        if tree
            .node(h_k)
            .snapshot
            .sched
            .runnable_tids()
            .contains(&tid)
        {
            return Some(h_k);
        }
    }
    None
}

/// Tag every runnable sibling at the pre-state of the conflicting
/// transition; used when the interesting thread was not enabled there and
/// when an alloc/free ordering needs exploring.
fn tag_all_siblings(tree: &mut Tree, at: NodeId) {
    let tids = tree.node(at).snapshot.sched.runnable_tids();
    for tid in tids {
        tree.tag_sibling(at, tid);
    }
}

/// Runs the partial-order-reduction pass for the transition that just
/// ended at `new_id`: fills in the node's conflict and happens-before
/// vectors against every ancestor, reports data races, and tags the
/// sibling reorderings worth exploring.
pub fn update_dpor(
    tree: &mut Tree,
    races: &mut DataRaceTable,
    channel: &mut dyn JobChannel,
    profile: &dyn GuestProfile,
    new_id: NodeId,
    preloaded_drs: bool,
    total_jumps: u64,
) {
    let new_tid = match tree.node(new_id).chosen_thread {
        Some(tid) => tid,
        None => return, // root: no transition to compare
    };
    let depth = tree.node(new_id).depth;
    let path = tree.path_from_root(new_id);
    assert_eq!(path.len() as u32, depth + 1);

    // A race found with no artificial preemptions would have been found by
    // a single-pass detector too.
    let deterministic = !preloaded_drs && total_jumps == 0;

    let new_clock = {
        let node = tree.node(new_id);
        node.snapshot
            .sched
            .thread(new_tid)
            .map(|t| t.clock.clone())
            .unwrap_or_else(|| fatal!("transition thread {} missing from its own snapshot", new_tid))
    };

    let mut tags: Vec<NodeId> = Vec::new();
    let mut tag_alls: Vec<NodeId> = Vec::new();
    let mut enables: Vec<(NodeId, u32)> = Vec::new();
    let mut conflicts = vec![false; depth as usize];
    let mut happens_before = vec![false; depth as usize];

    for i in (1..depth).rev() {
        let anc_id = path[i as usize];
        let anc_tid = match tree.node(anc_id).chosen_thread {
            Some(tid) => tid,
            None => continue,
        };

        if anc_tid == new_tid {
            // program order; not an interleaving candidate
            happens_before[i as usize] = true;
            continue;
        }

        let anc_clock = tree
            .node(anc_id)
            .snapshot
            .sched
            .thread(anc_tid)
            .map(|t| t.clock.clone());
        let hb = anc_clock
            .map(|c| c.happens_before(&new_clock))
            .unwrap_or(false);
        happens_before[i as usize] = hb;

        let (conflict, chunk_change, observations) =
            shm_intersect(tree, races, profile, new_id, anc_id, !hb);
        conflicts[i as usize] = conflict;

        if !conflict || hb {
            continue;
        }

        for obs in observations {
            log!(
                LogLevel::LogDebug,
                "data race {:#x} (tid{}) vs {:#x} (tid{}){}",
                obs.earlier.eip,
                obs.earlier.tid,
                obs.later.eip,
                obs.later.tid,
                if obs.confirmed { " (confirmed)" } else { " (suspected)" }
            );
            if obs.confirmed {
                channel.send(OutputMessage::DataRace {
                    eip: obs.later.eip,
                    tid: obs.later.tid,
                    last_call: obs.later.last_call,
                    most_recent_syscall: obs.later.most_recent_syscall,
                    confirmed: true,
                    deterministic,
                });
            }
            // For unconfirmed pairs only a PP on the earlier access helps,
            // so the later side of suspected pairs stays unsent; obviously
            // bogus init/destroy suspects stay quiet entirely.
            if obs.confirmed || !obs.too_suspicious {
                channel.send(OutputMessage::DataRace {
                    eip: obs.earlier.eip,
                    tid: obs.earlier.tid,
                    last_call: obs.earlier.last_call,
                    most_recent_syscall: obs.earlier.most_recent_syscall,
                    confirmed: obs.confirmed,
                    deterministic,
                });
            }
            if let Some(enable) = obs.enable_speculative {
                enables.push(enable);
            }
        }

        match find_reorder_point(tree, &path, i, new_tid) {
            Some(h_k) => tags.push(h_k),
            None => tag_alls.push(path[i as usize - 1]),
        }
        if chunk_change {
            // explore allocating before freeing as well
            tag_alls.push(path[i as usize - 1]);
        }
    }

    {
        let node = tree.node_mut(new_id);
        node.conflicts = conflicts;
        node.happens_before = happens_before;
    }

    for h_k in tags {
        log!(
            LogLevel::LogDebug,
            "dpor tags tid {} at node {:?}",
            new_tid,
            h_k
        );
        tree.tag_sibling(h_k, new_tid);
    }
    for at in tag_alls {
        tag_all_siblings(tree, at);
    }
    for (node, eip) in enables {
        let h = tree.node_mut(node);
        if h.data_race_eip == Some(eip) && !h.is_preemption_point {
            log!(
                LogLevel::LogDebug,
                "data race enables speculative PP at {:?}",
                node
            );
            h.is_preemption_point = true;
        }
    }
}

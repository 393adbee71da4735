use crate::log::LogLevel;
use crate::machine::Machine;
use crate::stack::StackTrace;
use crate::tree::{NodeId, Snapshot, Tree};
use crate::vector_clock::Tid;

/// Owns the choice tree and the position in it, and moves the machine
/// between preemption points via its bookmark facility.
pub struct SaveState {
    pub tree: Tree,
    /// The node whose transition is currently executing away from; None
    /// until the first setjmp.
    pub current: Option<NodeId>,
    /// Thread chosen to run the in-flight transition.
    pub next_tid: Option<Tid>,
    /// Set by longjmp until the rewound-to preemption point is re-reached.
    pub just_jumped: bool,

    pub total_choices: u64,
    pub total_jumps: u64,
    /// Instructions executed across all committed transitions.
    pub total_triggers: u64,
    /// Sum of branch depths at branch ends, for the average-depth check.
    pub depth_total: u64,
}

impl SaveState {
    pub fn new() -> SaveState {
        SaveState {
            tree: Tree::new(),
            current: None,
            next_tid: None,
            just_jumped: false,
            total_choices: 0,
            total_jumps: 0,
            total_triggers: 0,
            depth_total: 0,
        }
    }

    /// Checkpoints the live state at a preemption point: asks the machine
    /// for a bookmark and files a new node under the current one. The
    /// snapshot must be taken before the per-transition access records are
    /// reset.
    #[allow(clippy::too_many_arguments)]
    pub fn setjmp(
        &mut self,
        m: &mut dyn Machine,
        snapshot: Snapshot,
        eip: u32,
        trigger_count: u64,
        transition_triggers: u64,
        stack_trace: Option<StackTrace>,
        is_preemption_point: bool,
        data_race_eip: Option<u32>,
        voluntary: bool,
        usecs: u64,
    ) -> NodeId {
        let bookmark = m.bookmark_here();
        let id = self.tree.insert(
            self.current,
            eip,
            trigger_count,
            self.next_tid,
            stack_trace,
            snapshot,
            bookmark,
            is_preemption_point,
            data_race_eip,
            voluntary,
        );
        self.tree.node_mut(id).usecs = usecs;
        self.current = Some(id);
        self.total_choices += 1;
        self.total_triggers += transition_triggers;
        log!(
            LogLevel::LogDebug,
            "saved choice point {:?} at {:#x} (tid {:?}, depth {}{})",
            id,
            eip,
            self.tree.node(id).chosen_thread,
            self.tree.node(id).depth,
            if voluntary { ", voluntary" } else { "" }
        );
        id
    }

    /// Abandons the current branch: rewinds the machine to `target`'s
    /// bookmark, then hands back a copy of its captured state for the
    /// caller to install. Machine rewind strictly precedes any state
    /// restoration.
    pub fn longjmp(&mut self, m: &mut dyn Machine, target: NodeId) -> Snapshot {
        let current = self.current.unwrap_or_else(|| fatal!("longjmp before setjmp"));
        self.depth_total += self.tree.node(current).depth as u64;

        let node = self.tree.node(target);
        assert!(!node.all_explored);
        m.rewind_to(node.bookmark);

        self.total_jumps += 1;
        self.current = Some(target);
        self.next_tid = node.chosen_thread;
        self.just_jumped = true;
        log!(
            LogLevel::LogDebug,
            "jumped to {:?} at {:#x} (depth {}, jump #{})",
            target,
            node.eip,
            node.depth,
            self.total_jumps
        );
        self.tree.node(target).snapshot.clone()
    }
}

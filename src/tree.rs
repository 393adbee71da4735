use crate::machine::BookmarkHandle;
use crate::memory::MemState;
use crate::schedule::ThreadTable;
use crate::sorted_vec::SortedVec;
use crate::stack::StackTrace;
use crate::testcase::TestState;
use crate::user_sync::UserSyncState;
use crate::vector_clock::Tid;

/// Nodes live in an arena and refer to each other by id; parent and child
/// links never form an ownership cycle.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct NodeId(pub u32);

/// Deep copy of all engine state captured when a preemption point was
/// reached. Restoring one of these plus rewinding the machine reproduces
/// the exact event sequence that followed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub sched: ThreadTable,
    pub test: TestState,
    pub kern_mem: MemState,
    pub user_mem: MemState,
    pub user_sync: UserSyncState,
}

/// One preemption point reached. The stored state reflects the *completion*
/// of the transition that got here, i.e. the moment the next choice is made.
#[derive(Clone, Debug)]
pub struct Hax {
    /// eip of the upcoming choice.
    pub eip: u32,
    pub trigger_count: u64,
    /// Thread whose transition produced this node; None at the root.
    pub chosen_thread: Option<Tid>,
    pub stack_trace: Option<StackTrace>,

    pub depth: u32,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,

    pub snapshot: Snapshot,
    pub bookmark: BookmarkHandle,

    /// Ancestors whose transitions are not independent of this one.
    /// Indexed by ancestor depth; length equals `depth`.
    pub conflicts: Vec<bool>,
    /// Ancestors ordered before this transition by sync alone.
    pub happens_before: Vec<bool>,

    pub all_explored: bool,
    /// A bookmark exists here, but it only becomes a real choice point if
    /// DPOR or a data race demands it.
    pub is_preemption_point: bool,
    /// Set on speculative nodes: the suspected racing eip in the upcoming
    /// transition.
    pub data_race_eip: Option<u32>,
    /// The thread reached this point by yielding/descheduling on its own
    /// rather than being timer-preempted.
    pub voluntary: bool,

    /// Sibling choices DPOR wants explored from here.
    pub tagged: SortedVec<Tid>,

    // estimation state, updated at the end of each branch
    pub marked_children: u64,
    pub marked_children_old: u64,
    pub proportion: f64,
    pub usecs: u64,
    pub subtree_usecs: f64,
    pub estimate_computed: bool,
}

impl Hax {
    /// A child is marked if we explored it already or tagged it for later:
    /// either way it will be in the tree eventually.
    pub fn is_marked(&self, tree: &Tree, tid: Tid) -> bool {
        self.tagged.contains_key(tid)
            || self
                .children
                .iter()
                .any(|&c| tree.node(c).chosen_thread == Some(tid))
    }
}

#[derive(Default)]
pub struct Tree {
    nodes: Vec<Hax>,
    root: Option<NodeId>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Hax {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Hax {
        &mut self.nodes[id.0 as usize]
    }

    /// Appends a node under `parent` (or as the root) and links it in.
    pub fn insert(
        &mut self,
        parent: Option<NodeId>,
        eip: u32,
        trigger_count: u64,
        chosen_thread: Option<Tid>,
        stack_trace: Option<StackTrace>,
        snapshot: Snapshot,
        bookmark: BookmarkHandle,
        is_preemption_point: bool,
        data_race_eip: Option<u32>,
        voluntary: bool,
    ) -> NodeId {
        let depth = match parent {
            Some(p) => self.node(p).depth + 1,
            None => 0,
        };
        assert!(
            parent.is_some() || self.root.is_none(),
            "two roots in the choice tree"
        );

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Hax {
            eip,
            trigger_count,
            chosen_thread,
            stack_trace,
            depth,
            parent,
            children: Vec::new(),
            snapshot,
            bookmark,
            conflicts: vec![false; depth as usize],
            happens_before: vec![false; depth as usize],
            all_explored: false,
            is_preemption_point,
            data_race_eip,
            voluntary,
            tagged: SortedVec::new(),
            marked_children: 0,
            marked_children_old: 0,
            proportion: 0.0,
            usecs: 0,
            subtree_usecs: 0.0,
            estimate_computed: false,
        });

        match parent {
            Some(p) => self.node_mut(p).children.push(id),
            None => self.root = Some(id),
        }
        id
    }

    /// The ancestor of `id` at `depth` (depth must not exceed the node's).
    pub fn ancestor_at_depth(&self, id: NodeId, depth: u32) -> NodeId {
        let mut at = id;
        while self.node(at).depth > depth {
            at = match self.node(at).parent {
                Some(p) => p,
                None => fatal!("ran off the root looking for depth {}", depth),
            };
        }
        assert_eq!(self.node(at).depth, depth);
        at
    }

    /// Root-to-leaf path ending at `id`.
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut at = id;
        while let Some(p) = self.node(at).parent {
            path.push(p);
            at = p;
        }
        path.reverse();
        path
    }

    pub fn child_with_choice(&self, id: NodeId, tid: Tid) -> Option<NodeId> {
        self.node(id)
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).chosen_thread == Some(tid))
    }

    /// Records that DPOR wants the sibling running `tid` explored from this
    /// node, upgrading a speculative node into a real preemption point.
    pub fn tag_sibling(&mut self, id: NodeId, tid: Tid) {
        let node = self.node_mut(id);
        node.tagged.insert(tid);
        node.is_preemption_point = true;
        node.all_explored = false;
    }
}

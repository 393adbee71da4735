use crate::lockset::{LockSet, LocksetCmp};
use crate::log::LogLevel;
use crate::profile::AddrSpace;
use crate::stack::StackTrace;
use std::collections::BTreeMap;
use std::fmt;

pub type ChunkId = u32;

/// One live or freed allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapChunk {
    pub base: u32,
    pub len: u32,
    pub id: ChunkId,
    pub alloc_trace: StackTrace,
    pub free_trace: Option<StackTrace>,
    /// Pages grabbed by the page allocator to back the malloc arena. An
    /// access inside one that is not also inside a malloced block is still
    /// illegal.
    pub reserved_for_malloc: bool,
}

/// Ordered-by-base map of non-overlapping chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkTree {
    map: BTreeMap<u32, HeapChunk>,
}

impl ChunkTree {
    pub fn new() -> ChunkTree {
        ChunkTree::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeapChunk> {
        self.map.values()
    }

    /// The chunk with base <= addr < base + len, if any.
    pub fn containing(&self, addr: u32) -> Option<&HeapChunk> {
        self.map
            .range(..=addr)
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| addr < c.base + c.len)
    }

    pub fn insert(&mut self, chunk: HeapChunk) {
        if self.containing(chunk.base).is_some() {
            fatal!(
                "allocated a block already contained in the heap: [{:#x} | {}]",
                chunk.base,
                chunk.len
            );
        }
        self.map.insert(chunk.base, chunk);
    }

    /// Insert, absorbing into an existing containing chunk (used by the
    /// freed tree, where adjacent frees coalesce).
    pub fn insert_coalescing(&mut self, chunk: HeapChunk) {
        let existing_base = self.containing(chunk.base).map(|c| c.base);
        match existing_base {
            Some(base) => {
                let parent = self.map.get_mut(&base).unwrap();
                let reach = chunk.len + chunk.base - parent.base;
                if reach > parent.len {
                    parent.len = reach;
                }
            }
            None => {
                self.map.insert(chunk.base, chunk);
            }
        }
    }

    /// Removes and returns the chunk containing `addr`.
    pub fn remove_containing(&mut self, addr: u32) -> Option<HeapChunk> {
        let base = self.containing(addr)?.base;
        self.map.remove(&base)
    }
}

impl fmt::Display for ChunkTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.map.values().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{:#x} | {}]", c.base, c.len)?;
        }
        write!(f, "}}")
    }
}

/// Which heap chunk(s) an access record has touched, across coalescing.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ChunkIdInfo {
    NotInHeap,
    Chunk(ChunkId),
    MultipleChunks,
}

impl ChunkIdInfo {
    /// Lattice join: NotInHeap absorbs into Chunk, disagreeing ids promote
    /// to MultipleChunks.
    pub fn merge(&mut self, other: ChunkIdInfo) {
        use ChunkIdInfo::*;
        *self = match (*self, other) {
            (MultipleChunks, _) | (_, MultipleChunks) => MultipleChunks,
            (Chunk(a), Chunk(b)) => {
                if a == b {
                    Chunk(a)
                } else {
                    MultipleChunks
                }
            }
            (Chunk(a), NotInHeap) => Chunk(a),
            (NotInHeap, x) => x,
        };
    }

    /// A free-then-realloc slipped between two accesses to the same address.
    pub fn chunk_changed(a: ChunkIdInfo, b: ChunkIdInfo) -> bool {
        match (a, b) {
            (ChunkIdInfo::Chunk(x), ChunkIdInfo::Chunk(y)) => x != y,
            _ => false,
        }
    }
}

/// Everything known about the circumstances of one (coalesced) access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessLockset {
    pub eip: u32,
    pub write: bool,
    pub during_init: bool,
    pub during_destroy: bool,
    pub interrupts_enabled: bool,
    pub last_call: u32,
    pub most_recent_syscall: u32,
    pub chunk_ids: ChunkIdInfo,
    pub locks_held: LockSet,
}

/// Context of the access being recorded right now; turned into an
/// `AccessLockset` unless an existing record subsumes it.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub eip: u32,
    pub write: bool,
    pub during_init: bool,
    pub during_destroy: bool,
    pub interrupts_enabled: bool,
    pub last_call: u32,
    pub most_recent_syscall: u32,
    pub chunk_ids: ChunkIdInfo,
    pub locks_held: LockSet,
}

/// All accesses to one address during the current transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemAccess {
    pub addr: u32,
    pub any_writes: bool,
    pub count: u32,
    pub locksets: Vec<AccessLockset>,
}

impl MemAccess {
    fn new(addr: u32) -> MemAccess {
        MemAccess {
            addr,
            any_writes: false,
            count: 0,
            locksets: Vec::new(),
        }
    }

    /// Repeated accesses under identical circumstances coalesce instead of
    /// growing the list: an existing record with an equal or smaller
    /// lockset subsumes the new access; a new access with a strictly
    /// smaller lockset upgrades (replaces) old records, absorbing their
    /// chunk-id info.
    pub fn add_lockset(&mut self, ctx: &AccessContext) {
        let mut chunk_ids = ctx.chunk_ids;
        let mut need_add = true;
        let mut removed = Vec::new();

        for (i, old) in self.locksets.iter_mut().enumerate() {
            if old.during_init != ctx.during_init || old.during_destroy != ctx.during_destroy {
                continue;
            }
            if old.most_recent_syscall != ctx.most_recent_syscall {
                continue;
            }
            if old.last_call != ctx.last_call {
                continue;
            }
            if old.eip != ctx.eip {
                continue;
            }
            if old.interrupts_enabled != ctx.interrupts_enabled {
                continue;
            }

            match ctx.locks_held.compare(&old.locks_held) {
                LocksetCmp::LocksetsSupset if ctx.write && !old.write => {
                    // we hold more locks but are a write and the old record
                    // was only a read; neither direction merges
                    continue;
                }
                LocksetCmp::LocksetsEq | LocksetCmp::LocksetsSupset => {
                    // the old record's lockset is at least as good for
                    // finding races on this access; fold into it
                    need_add = false;
                    old.chunk_ids.merge(chunk_ids);
                    old.write = old.write || ctx.write;
                    break;
                }
                LocksetCmp::LocksetsSubset if ctx.write || !old.write => {
                    // strictly fewer locks held now: strict upgrade over
                    // the old record (unless old wrote and we only read)
                    chunk_ids.merge(old.chunk_ids);
                    removed.push(i);
                }
                _ => continue,
            }
        }

        for &i in removed.iter().rev() {
            self.locksets.remove(i);
        }

        if need_add {
            self.locksets.insert(
                0,
                AccessLockset {
                    eip: ctx.eip,
                    write: ctx.write,
                    during_init: ctx.during_init,
                    during_destroy: ctx.during_destroy,
                    interrupts_enabled: ctx.interrupts_enabled,
                    last_call: ctx.last_call,
                    most_recent_syscall: ctx.most_recent_syscall,
                    chunk_ids,
                    locks_held: ctx.locks_held.clone(),
                },
            );
        }
    }
}

/// Per-thread allocator wrapper state, tolerating nesting where the guest
/// layers malloc over a page allocator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub in_alloc: bool,
    pub in_realloc: bool,
    pub in_free: bool,
    pub in_page_alloc: bool,
    pub in_page_free: bool,
    pub alloc_request_size: u32,
    pub palloc_request_size: u32,
}

impl AllocFlags {
    pub fn in_any(&self) -> bool {
        self.in_alloc || self.in_realloc || self.in_free || self.in_page_alloc || self.in_page_free
    }
}

/// Heap and shared-memory tracking for one address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemState {
    pub space: AddrSpace,
    pub malloc_heap: ChunkTree,
    pub page_heap: ChunkTree,
    pub freed: ChunkTree,
    pub heap_size: u32,
    pub heap_next_id: ChunkId,
    pub in_mm_init: bool,
    /// Accesses since the last preemption point. Stays empty for the
    /// address space not under test.
    pub shm: BTreeMap<u32, MemAccess>,
    /// Atomic-swap read value, for spotting swaps that store back the same
    /// value they read.
    pub during_xchg: bool,
    pub last_xchg_read: u32,
}

impl MemState {
    pub fn new(space: AddrSpace) -> MemState {
        MemState {
            space,
            malloc_heap: ChunkTree::new(),
            page_heap: ChunkTree::new(),
            freed: ChunkTree::new(),
            heap_size: 0,
            heap_next_id: 0,
            in_mm_init: false,
            shm: BTreeMap::new(),
            during_xchg: false,
            last_xchg_read: 0,
        }
    }

    fn heap(&mut self, page: bool) -> &mut ChunkTree {
        if page {
            &mut self.page_heap
        } else {
            &mut self.malloc_heap
        }
    }

    /// A live chunk containing `addr`. Pages reserved to back malloc don't
    /// count; an access there must hit a malloced block to be legal.
    pub fn find_alloced_chunk(&self, addr: u32) -> Option<&HeapChunk> {
        self.malloc_heap.containing(addr).or_else(|| {
            self.page_heap
                .containing(addr)
                .filter(|c| !c.reserved_for_malloc)
        })
    }

    /// Allocator entry. Reports reentrancy as a guest bug unless policy
    /// tolerates it (then the caller keeps per-thread flags). Malloc
    /// calling down into the page allocator is nesting, not reentry; each
    /// allocator checks only its own flags.
    pub fn alloc_enter(
        &mut self,
        flags: &mut AllocFlags,
        page: bool,
        size: u32,
    ) -> Result<(), String> {
        assert!(!self.in_mm_init);
        let (in_alloc, in_free) = if page {
            (flags.in_page_alloc, flags.in_page_free)
        } else {
            (flags.in_alloc, flags.in_free)
        };
        if in_alloc || in_free {
            return Err(format!(
                "Malloc (in {}) reentered {}!",
                self.space.name(),
                if in_alloc { "Malloc" } else { "Free" }
            ));
        }
        if page {
            flags.in_page_alloc = true;
            flags.palloc_request_size = size;
        } else {
            flags.in_alloc = true;
            flags.alloc_request_size = size;
        }
        Ok(())
    }

    /// Allocator exit. base == 0 means the guest is out of memory, which is
    /// suspect but not a bug.
    pub fn alloc_exit(&mut self, flags: &mut AllocFlags, page: bool, base: u32, trace: StackTrace) {
        let (in_alloc, size) = if page {
            (&mut flags.in_page_alloc, flags.palloc_request_size)
        } else {
            (&mut flags.in_alloc, flags.alloc_request_size)
        };
        assert!(*in_alloc, "attempt to exit malloc without being in!");
        *in_alloc = false;

        if base == 0 {
            log!(
                LogLevel::LogInfo,
                "{} seems to be out of memory",
                self.space.name()
            );
            return;
        }

        log!(LogLevel::LogDebug, "Malloc [{:#x} | {}]", base, size);
        // pages grabbed while inside the malloc wrapper back the arena
        let reserved_for_malloc = page && flags.in_alloc;
        let id = self.heap_next_id;
        self.heap_next_id = self
            .heap_next_id
            .checked_add(1)
            .unwrap_or_else(|| fatal!("heap chunk ids exhausted; need a wider type"));
        self.heap_size += size;
        self.heap(page).insert(HeapChunk {
            base,
            len: size,
            id,
            alloc_trace: trace,
            free_trace: None,
            reserved_for_malloc,
        });
    }

    /// Free entry. On success the chunk moves to the freed tree; the caller
    /// already dealt with double free / bad frees (those need the choice
    /// tree for ancestor walks, see `find_freed_chunk`).
    pub fn free_commit(&mut self, chunk: HeapChunk, free_trace: StackTrace) {
        self.heap_size -= chunk.len;
        assert!(chunk.free_trace.is_none());
        let mut chunk = chunk;
        chunk.free_trace = Some(free_trace);
        self.freed.insert_coalescing(chunk);
    }

    pub fn remove_live(&mut self, page: bool, addr: u32) -> Option<HeapChunk> {
        self.heap(page).remove_containing(addr)
    }

    /// Records a shared-memory access at `addr` for this transition.
    pub fn add_shm(&mut self, addr: u32, write: bool, ctx: &AccessContext) {
        let ma = self
            .shm
            .entry(addr)
            .or_insert_with(|| MemAccess::new(addr));
        ma.count += 1;
        ma.any_writes = ma.any_writes || write;
        ma.add_lockset(ctx);
    }

    /// Dropped at each preemption point: the records describe exactly one
    /// transition.
    pub fn reset_shm(&mut self) {
        self.shm.clear();
        self.during_xchg = false;
    }
}

/// Suspected and confirmed racy eip pairs. Lives outside the snapshots: a
/// rewind must not forget which orderings other branches witnessed.
#[derive(Clone, Debug, Default)]
pub struct DataRaceTable {
    map: BTreeMap<(u32, u32), RaceOrders>,
    pub suspected: u32,
    pub confirmed: u32,
}

#[derive(Copy, Clone, Debug, Default)]
struct RaceOrders {
    lo_executed_first: bool,
    hi_executed_first: bool,
}

impl DataRaceTable {
    pub fn new() -> DataRaceTable {
        DataRaceTable::default()
    }

    /// Records one witnessed ordering of a suspected race. Returns true
    /// once both orderings have been seen across branches.
    pub fn record(&mut self, earlier_eip: u32, later_eip: u32) -> bool {
        let lo = earlier_eip.min(later_eip);
        let hi = earlier_eip.max(later_eip);
        let lo_first = earlier_eip == lo;

        match self.map.get_mut(&(lo, hi)) {
            Some(orders) => {
                let newly_confirmed = if lo_first {
                    !orders.lo_executed_first && orders.hi_executed_first
                } else {
                    !orders.hi_executed_first && orders.lo_executed_first
                };
                if lo_first {
                    orders.lo_executed_first = true;
                } else {
                    orders.hi_executed_first = true;
                }
                if newly_confirmed {
                    self.confirmed += 1;
                }
                orders.lo_executed_first && orders.hi_executed_first
            }
            None => {
                self.map.insert(
                    (lo, hi),
                    RaceOrders {
                        lo_executed_first: lo_first,
                        hi_executed_first: !lo_first,
                    },
                );
                self.suspected += 1;
                false
            }
        }
    }
}

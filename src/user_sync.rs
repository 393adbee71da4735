use crate::log::LogLevel;
use crate::sorted_vec::SortedVec;

/// How many consecutive yield-only transitions before a user thread counts
/// as blocked.
pub const TOO_MANY_YIELDS: u32 = 10;
/// Same idea for threads spinning on an atomic swap.
pub const TOO_MANY_XCHGS: u32 = 10;

/// Per-thread yield-loop tracking. Lives on the thread and is snapshotted
/// into the tree with it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YieldState {
    /// How many transitions went by where the thread did nothing but spin
    /// in a yield loop. Saturates at TOO_MANY_YIELDS.
    pub loop_count: u32,
    /// Set retroactively once the counter maxes, so earlier snapshots of
    /// the spin get treated as blocked too.
    pub blocked: bool,
    /// User addresses the spinner has read while suspected of spinning. A
    /// foreign write to any of these unblocks it.
    pub observed: SortedVec<u32>,
}

impl YieldState {
    pub fn is_blocked(&self) -> bool {
        assert!(self.loop_count <= TOO_MANY_YIELDS);
        self.loop_count == TOO_MANY_YIELDS || self.blocked
    }

    pub fn unblock(&mut self) {
        self.loop_count = 0;
        self.blocked = false;
        self.observed.clear();
    }
}

/// What the currently-running thread has done since the last preemption
/// point, as far as yield-blocking is concerned. Reset each transition; if
/// it still says "yielded and nothing else" at the next PP, the thread's
/// loop counter goes up.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum YieldProgress {
    NothingInteresting,
    Yielded,
    Activity,
}

impl Default for YieldProgress {
    fn default() -> YieldProgress {
        YieldProgress::NothingInteresting
    }
}

/// A dynamically-allocated piece of a user mutex, learned by watching
/// mutex_init call malloc.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MutexChunk {
    pub base: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMutex {
    pub addr: u32,
    pub chunks: Vec<MutexChunk>,
}

/// Userspace synchronization model: the set of known user mutexes (only the
/// ones whose init was seen to malloc) and the yield-progress machine for
/// the running thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserSyncState {
    /// Size of the static part of the guest's mutex type; 0 until learned.
    pub mutex_size: u32,
    pub mutexes: Vec<UserMutex>,
    pub yield_progress: YieldProgress,
    /// Atomic swaps by the current thread since the last PP.
    pub xchg_count: u32,
}

impl UserSyncState {
    pub fn new() -> UserSyncState {
        UserSyncState::default()
    }

    /// Registers a malloced chunk as part of the mutex at `lock_addr`,
    /// creating the mutex record if this is the first chunk.
    pub fn learn_malloced_mutex_structure(&mut self, lock_addr: u32, base: u32, size: u32) {
        let mutex = match self.mutexes.iter_mut().find(|m| m.addr == lock_addr) {
            Some(m) => m,
            None => {
                log!(
                    LogLevel::LogDebug,
                    "created user mutex {:#x} ({} others)",
                    lock_addr,
                    self.mutexes.len()
                );
                self.mutexes.push(UserMutex {
                    addr: lock_addr,
                    chunks: Vec::new(),
                });
                self.mutexes.last_mut().unwrap()
            }
        };
        assert!(
            mutex.chunks.iter().all(|c| c.base != base),
            "mutex chunk registered twice"
        );
        mutex.chunks.push(MutexChunk { base, size });
        log!(
            LogLevel::LogDebug,
            "user mutex {:#x} grows chunk [{:#x} | {}]",
            lock_addr,
            base,
            size
        );
    }

    /// Forgets a destroyed mutex.
    pub fn mutex_destroy(&mut self, lock_addr: u32) {
        self.mutexes.retain(|m| m.addr != lock_addr);
    }

    /// Is `addr` inside the mutex at `lock_addr`, counting its learned
    /// heap-allocated parts?
    pub fn lock_contains_addr(&self, lock_addr: u32, addr: u32) -> bool {
        if addr >= lock_addr && addr < lock_addr + self.mutex_size {
            return true;
        }
        self.mutexes.iter().any(|m| {
            m.addr == lock_addr
                && m.chunks
                    .iter()
                    .any(|c| addr >= c.base && addr < c.base + c.size)
        })
    }

    /// Is `addr` inside any known user mutex? Such accesses are the lock
    /// implementation itself and never data races worth reporting.
    pub fn any_lock_contains_addr(&self, addr: u32) -> bool {
        self.mutexes.iter().any(|m| {
            (addr >= m.addr && addr < m.addr + self.mutex_size)
                || m.chunks
                    .iter()
                    .any(|c| addr >= c.base && addr < c.base + c.size)
        })
    }

    pub fn record_user_yield(&mut self) {
        if self.yield_progress == YieldProgress::NothingInteresting {
            self.yield_progress = YieldProgress::Yielded;
        }
    }

    /// Anything that is not "just spinning": a syscall besides yield, a
    /// lock operation, making another thread runnable.
    pub fn record_user_yield_activity(&mut self) {
        self.yield_progress = YieldProgress::Activity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yield_state_blocks_at_max() {
        let mut y = YieldState::default();
        for _ in 0..TOO_MANY_YIELDS {
            assert!(!y.blocked);
            y.loop_count += 1;
        }
        assert!(y.is_blocked());
        y.unblock();
        assert!(!y.is_blocked());
        assert_eq!(y.loop_count, 0);
    }

    #[test]
    fn learned_mutex_chunks_are_part_of_the_lock() {
        let mut u = UserSyncState::new();
        u.mutex_size = 8;
        u.learn_malloced_mutex_structure(0x5000, 0x9000, 16);
        assert!(u.lock_contains_addr(0x5000, 0x5004));
        assert!(u.lock_contains_addr(0x5000, 0x900c));
        assert!(!u.lock_contains_addr(0x5000, 0x9010));
        assert!(u.any_lock_contains_addr(0x9008));
        u.mutex_destroy(0x5000);
        assert!(!u.lock_contains_addr(0x5000, 0x900c));
        // the static part is still the lock itself
        assert!(u.lock_contains_addr(0x5000, 0x5004));
    }

    #[test]
    fn yield_progress_latches_activity() {
        let mut u = UserSyncState::new();
        u.record_user_yield();
        assert_eq!(u.yield_progress, YieldProgress::Yielded);
        u.record_user_yield_activity();
        u.record_user_yield();
        assert_eq!(u.yield_progress, YieldProgress::Activity);
    }
}

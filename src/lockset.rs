use crate::log::LogLevel;
use crate::sorted_vec::{SortKey, SortedVec};
use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LockKind {
    Mutex = 0,
    Sem = 1,
    RwlockWrite = 2,
    RwlockRead = 3,
}

/// Whether two kinds count as "the same lock" for recursion checks and for
/// exclusion. Write and read sides of an rwlock share an address and do
/// exclude each other; a mutex embedded in a cvar at the same address does
/// not.
pub fn same_lock_kind(k1: LockKind, k2: LockKind) -> bool {
    k1 == k2
        || (k1 == LockKind::RwlockWrite && k2 == LockKind::RwlockRead)
        || (k1 == LockKind::RwlockRead && k2 == LockKind::RwlockWrite)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Lock {
    pub addr: u32,
    pub kind: LockKind,
}

impl SortKey for Lock {
    type Key = (u32, u8);
    fn sort_key(&self) -> (u32, u8) {
        (self.addr, self.kind as u8)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LocksetCmp {
    LocksetsEq,
    /// self is a subset of the other
    LocksetsSubset,
    /// self is a superset of the other
    LocksetsSupset,
    LocksetsDiff,
}

/// The locks held by one thread at one point in time. Kernel and user locks
/// live in separate sets on the thread.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct LockSet {
    locks: SortedVec<Lock>,
}

impl LockSet {
    pub fn new() -> LockSet {
        LockSet {
            locks: SortedVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lock> {
        self.locks.iter()
    }

    pub fn add(&mut self, addr: u32, kind: LockKind) {
        log!(
            LogLevel::LogDebug,
            "adding {:#x} to lockset: {}",
            addr,
            self
        );
        for lock in self.locks.iter() {
            if lock.addr == addr && same_lock_kind(lock.kind, kind) {
                fatal!(
                    "recursive locking of {:#x} ({:?} already held as {:?})",
                    addr,
                    kind,
                    lock.kind
                );
            }
        }
        let inserted = self.locks.insert(Lock { addr, kind });
        assert!(inserted);
    }

    /// Removes the lock at `addr` whose kind matches `kind` (rwlock read and
    /// write sides match each other; unlockers need not know which side the
    /// holder took). Returns false if no such lock is held.
    pub fn remove(&mut self, addr: u32, kind: LockKind) -> bool {
        assert!(
            kind != LockKind::RwlockRead,
            "use RwlockWrite when unlocking an rwlock"
        );
        let found = self
            .locks
            .iter()
            .find(|l| l.addr == addr && same_lock_kind(l.kind, kind))
            .copied();
        match found {
            Some(lock) => {
                self.locks.remove(lock.sort_key());
                true
            }
            None => false,
        }
    }

    /// Do the two sets share any lock that provides mutual exclusion?
    pub fn intersects(&self, other: &LockSet) -> bool {
        // Sets are tiny; quadratic is fine.
        for l0 in self.locks.iter() {
            for l1 in other.locks.iter() {
                if l0.addr == l1.addr && same_lock_kind(l0.kind, l1.kind) {
                    return true;
                }
            }
        }
        false
    }

    /// Subset comparison via one sorted merge pass.
    pub fn compare(&self, other: &LockSet) -> LocksetCmp {
        let mut result = LocksetCmp::LocksetsEq;
        let mut i = 0;
        let mut j = 0;

        while i < self.locks.len() || j < other.locks.len() {
            if i == self.locks.len() {
                // other has extra elements
                return if result == LocksetCmp::LocksetsSupset {
                    LocksetCmp::LocksetsDiff
                } else {
                    LocksetCmp::LocksetsSubset
                };
            } else if j == other.locks.len() {
                // we have extra elements
                return if result == LocksetCmp::LocksetsSubset {
                    LocksetCmp::LocksetsDiff
                } else {
                    LocksetCmp::LocksetsSupset
                };
            }

            let k0 = self.locks.get(i).sort_key();
            let k1 = other.locks.get(j).sort_key();
            if k0 < k1 {
                // this lock is missing from other
                if result == LocksetCmp::LocksetsSubset {
                    return LocksetCmp::LocksetsDiff;
                }
                result = LocksetCmp::LocksetsSupset;
                i += 1;
            } else if k0 > k1 {
                // this lock is missing from us
                if result == LocksetCmp::LocksetsSupset {
                    return LocksetCmp::LocksetsDiff;
                }
                result = LocksetCmp::LocksetsSubset;
                j += 1;
            } else {
                i += 1;
                j += 1;
            }
        }

        result
    }
}

impl fmt::Display for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, lock) in self.locks.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            let suffix = match lock.kind {
                LockKind::Mutex => "",
                LockKind::Sem => "(s)",
                LockKind::RwlockWrite => "(w)",
                LockKind::RwlockRead => "(r)",
            };
            write!(f, "{:#x}{}", lock.addr, suffix)?;
        }
        Ok(())
    }
}

use crate::lockset::{LockKind, LockSet};
use crate::log::LogLevel;
use crate::memory::AllocFlags;
use crate::profile::AddrSpace;
use crate::user_sync::YieldState;
use crate::vector_clock::{LockClocks, Tid, VectorClock};
use std::fmt;

bitflags! {
    /// Transient conditions of one guest thread, inferred from watched
    /// entry/exit eips.
    pub struct Action: u32 {
        /// A timer handler frame is on this thread's stack.
        const HANDLING_TIMER   = 1 << 0;
        /// Inside the context switcher (not necessarily handling a timer).
        const CONTEXT_SWITCH   = 1 << 1;
        /// About to create a new thread.
        const FORKING          = 1 << 2;
        /// About to take a spin on the sleep queue.
        const SLEEPING         = 1 << 3;
        /// In the final-exit path.
        const VANISHING        = 1 << 4;
        /// Reading lines.
        const READLINING       = 1 << 5;
        const MUTEX_LOCKING    = 1 << 6;
        const MUTEX_UNLOCKING  = 1 << 7;
        /// Initializing a sync object (addr in `sync_init_addr`).
        const SYNC_INITING     = 1 << 8;
        const SYNC_DESTROYING  = 1 << 9;
        /// Inside a userspace malloc-family wrapper.
        const USER_MALLOC_WRAPPER = 1 << 10;
        /// Kernel copying to/from user buffers on the user's behalf.
        const VM_USER_COPY     = 1 << 11;
    }
}

/// Replica of one schedulable guest thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Thread {
    pub tid: Tid,
    pub action: Action,
    pub most_recent_syscall: u32,
    /// Return address observed at the last watched function entry; used to
    /// tell apart call sites in data-race reports.
    pub last_call: u32,
    /// Address a userspace mutex spin is blocked on, if any.
    pub blocked_on_addr: Option<u32>,
    /// Sync object currently being initialized or destroyed by this thread.
    pub sync_init_addr: Option<u32>,
    pub sync_destroy_addr: Option<u32>,
    /// The unlock wrapper this thread is inside, applied at wrapper exit
    /// (the lock is genuinely held until then).
    pub pending_unlock: Option<(u32, LockKind)>,
    pub kern_locks: LockSet,
    pub user_locks: LockSet,
    /// Allocator wrapper state is per thread so that reentrant or nested
    /// allocator calls in some guests stay distinguishable.
    pub kern_alloc_flags: AllocFlags,
    pub user_alloc_flags: AllocFlags,
    pub clock: VectorClock,
    pub user_yield: YieldState,
    pub xchg_count: u32,
}

impl Thread {
    pub fn new(tid: Tid) -> Thread {
        // Each thread begins in its own first epoch, so unsynchronized
        // threads never compare as ordered.
        let mut clock = VectorClock::new();
        clock.inc(tid);
        Thread {
            tid,
            action: Action::empty(),
            most_recent_syscall: 0,
            last_call: 0,
            blocked_on_addr: None,
            sync_init_addr: None,
            sync_destroy_addr: None,
            pending_unlock: None,
            kern_locks: LockSet::new(),
            user_locks: LockSet::new(),
            kern_alloc_flags: AllocFlags::default(),
            user_alloc_flags: AllocFlags::default(),
            clock,
            user_yield: YieldState::default(),
            xchg_count: 0,
        }
    }

    pub fn locks(&self, space: AddrSpace) -> &LockSet {
        match space {
            AddrSpace::Kern => &self.kern_locks,
            AddrSpace::User => &self.user_locks,
        }
    }

    pub fn locks_mut(&mut self, space: AddrSpace) -> &mut LockSet {
        match space {
            AddrSpace::Kern => &mut self.kern_locks,
            AddrSpace::User => &mut self.user_locks,
        }
    }

    pub fn alloc_flags(&self, space: AddrSpace) -> &AllocFlags {
        match space {
            AddrSpace::Kern => &self.kern_alloc_flags,
            AddrSpace::User => &self.user_alloc_flags,
        }
    }

    pub fn alloc_flags_mut(&mut self, space: AddrSpace) -> &mut AllocFlags {
        match space {
            AddrSpace::Kern => &mut self.kern_alloc_flags,
            AddrSpace::User => &mut self.user_alloc_flags,
        }
    }
}

/// Replica of the guest scheduler: runqueue, descheduled queue, sleep queue.
/// Consistent with the guest at every preemption point, not necessarily at
/// every intermediate instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadTable {
    rq: Vec<Thread>,
    dq: Vec<Thread>,
    sq: Vec<Thread>,
    cur: Tid,
    last: Tid,
    /// The guest set its current-TCB to a thread we have not seen become
    /// runnable yet; resolve on the matching runnable event.
    context_switch_pending: bool,
    context_switch_target: Tid,
    /// Vanished threads stay current in some guests until somebody else
    /// runs; keep the most recent one alive until then.
    last_vanished: Option<Thread>,
    /// Fully-retired threads. Not schedulable, but their clocks and
    /// locksets must outlive them for the race reasoning over snapshots.
    reaped: Vec<Thread>,
    pub guest_init_done: bool,
    /// Set while we are firing timer interrupts to land on a chosen thread.
    pub schedule_in_flight: Option<Tid>,
    pub lock_clocks: LockClocks,
}

impl ThreadTable {
    pub fn new(initial_runqueue: &[Tid], init_tid: Tid) -> ThreadTable {
        let rq: Vec<Thread> = initial_runqueue.iter().map(|&t| Thread::new(t)).collect();
        assert!(
            rq.iter().any(|t| t.tid == init_tid),
            "init thread missing from initial runqueue"
        );
        ThreadTable {
            rq,
            dq: Vec::new(),
            sq: Vec::new(),
            cur: init_tid,
            last: init_tid,
            context_switch_pending: false,
            context_switch_target: 0,
            last_vanished: None,
            reaped: Vec::new(),
            guest_init_done: false,
            schedule_in_flight: None,
            lock_clocks: LockClocks::new(),
        }
    }

    pub fn current_tid(&self) -> Tid {
        self.cur
    }

    pub fn last_tid(&self) -> Tid {
        self.last
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.rq
            .iter()
            .chain(self.dq.iter())
            .chain(self.sq.iter())
            .find(|t| t.tid == tid)
            .or_else(|| self.last_vanished.as_ref().filter(|t| t.tid == tid))
            .or_else(|| self.reaped.iter().find(|t| t.tid == tid))
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        let vanished = &mut self.last_vanished;
        let reaped = &mut self.reaped;
        self.rq
            .iter_mut()
            .chain(self.dq.iter_mut())
            .chain(self.sq.iter_mut())
            .find(|t| t.tid == tid)
            .or_else(move || {
                vanished
                    .as_mut()
                    .filter(|t| t.tid == tid)
                    .or_else(move || reaped.iter_mut().find(|t| t.tid == tid))
            })
    }

    pub fn current(&self) -> &Thread {
        match self.thread(self.cur) {
            Some(t) => t,
            None => fatal!("current thread {} not in any queue", self.cur),
        }
    }

    pub fn current_mut(&mut self) -> &mut Thread {
        let cur = self.cur;
        match self.thread_mut(cur) {
            Some(t) => t,
            None => fatal!("current thread {} not in any queue", cur),
        }
    }

    pub fn on_runqueue(&self, tid: Tid) -> bool {
        self.rq.iter().any(|t| t.tid == tid)
    }

    pub fn on_sleep_queue(&self, tid: Tid) -> bool {
        self.sq.iter().any(|t| t.tid == tid)
    }

    /// Runnable candidates in arbiter preference order: runqueue first,
    /// then sleepers (which the guest may wake at any tick).
    pub fn runnable_tids(&self) -> Vec<Tid> {
        self.rq
            .iter()
            .map(|t| t.tid)
            .chain(self.sq.iter().map(|t| t.tid))
            .collect()
    }

    pub fn alive_tids(&self) -> Vec<Tid> {
        self.rq
            .iter()
            .chain(self.dq.iter())
            .chain(self.sq.iter())
            .map(|t| t.tid)
            .collect()
    }

    /// Tracks the guest's current-TCB value, observed once per instruction.
    pub fn observe_current(&mut self, new_tid: Tid, eip: u32) {
        let old_tid = self.cur;
        if old_tid == new_tid || self.context_switch_pending {
            return;
        }
        if self.on_runqueue(new_tid) || self.on_sleep_queue(new_tid) {
            log!(
                LogLevel::LogDebug,
                "switched threads {} -> {} at {:#x}",
                old_tid,
                new_tid,
                eip
            );
            self.last = old_tid;
            self.cur = new_tid;
            if self.schedule_in_flight == Some(new_tid) {
                self.schedule_in_flight = None;
            }
            // somebody else runs now; the vanished thread's tcb is dead
            if self.last_vanished.as_ref().map(|t| t.tid) != Some(new_tid) {
                if let Some(thread) = self.last_vanished.take() {
                    self.reaped.push(thread);
                }
            }
        } else {
            // On some guests the tcb switches before the new thread's
            // runnable event fires; recognize it when that event arrives.
            log!(
                LogLevel::LogDebug,
                "about to switch threads {} -> {} at {:#x}",
                old_tid,
                new_tid,
                eip
            );
            self.context_switch_pending = true;
            self.context_switch_target = new_tid;
        }
    }

    /// A thread is about to become runnable. Either the current thread is
    /// forking it into existence, or it is waking from the deschedule or
    /// sleep queue.
    pub fn on_thread_runnable(&mut self, tid: Tid, eip: u32) {
        let forking = {
            let cur = self.current();
            cur.action.contains(Action::FORKING) && !cur.action.contains(Action::HANDLING_TIMER)
        };
        if forking && self.thread(tid).is_none() {
            log!(LogLevel::LogDebug, "thread {} forked at {:#x} -- {}", tid, eip, self);
            // fork is a sync edge: the child inherits the parent's view
            let mut child = Thread::new(tid);
            let parent = self.current_mut();
            child.clock.merge(&parent.clock);
            parent.clock.inc(parent.tid);
            self.rq.insert(0, child);
        } else if let Some(pos) = self.dq.iter().position(|t| t.tid == tid) {
            let thread = self.dq.remove(pos);
            self.rq.insert(0, thread);
            log!(LogLevel::LogDebug, "thread {} wake at {:#x} -- {}", tid, eip, self);
        } else if let Some(pos) = self.sq.iter().position(|t| t.tid == tid) {
            let thread = self.sq.remove(pos);
            self.rq.insert(0, thread);
            log!(LogLevel::LogDebug, "thread {} wake from sleep at {:#x} -- {}", tid, eip, self);
        } else if self.thread(tid).is_none() {
            log!(
                LogLevel::LogWarn,
                "HURDLE VIOLATION: unknown thread {} became runnable at {:#x}",
                tid,
                eip
            );
            self.rq.insert(0, Thread::new(tid));
        }
        // If this is happening from the context switcher, the currently
        // running thread changes with it.
        if self.context_switch_pending && self.context_switch_target == tid {
            self.last = self.cur;
            self.cur = tid;
            self.context_switch_pending = false;
            if self.schedule_in_flight == Some(tid) {
                self.schedule_in_flight = None;
            }
        }
    }

    /// A thread is about to come off the runqueue: vanishing, sleeping, or
    /// plain descheduling.
    pub fn on_thread_descheduling(&mut self, tid: Tid, eip: u32) {
        let vanishing = {
            let cur = self.current();
            cur.action.contains(Action::VANISHING) && !cur.action.contains(Action::HANDLING_TIMER)
        };
        if vanishing {
            if self.cur != tid {
                log!(
                    LogLevel::LogWarn,
                    "HURDLE VIOLATION: thread {} vanishing but {} is current",
                    tid,
                    self.cur
                );
            }
            if let Some(pos) = self.rq.iter().position(|t| t.tid == tid) {
                let mut thread = self.rq.remove(pos);
                // later actions by this thread (e.g. scheduling its
                // successor) must not count as vanishing again
                thread.action.remove(Action::VANISHING);
                log!(LogLevel::LogDebug, "thread {} vanished at {:#x} -- {}", tid, eip, self);
                if let Some(previous) = self.last_vanished.take() {
                    self.reaped.push(previous);
                }
                self.last_vanished = Some(thread);
            }
        } else if let Some(pos) = self.rq.iter().position(|t| t.tid == tid) {
            let mut thread = self.rq.remove(pos);
            if thread.action.contains(Action::SLEEPING) {
                thread.action.remove(Action::SLEEPING);
                log!(LogLevel::LogDebug, "thread {} sleep at {:#x} -- {}", tid, eip, self);
                self.sq.push(thread);
            } else {
                log!(LogLevel::LogDebug, "thread {} deschedule at {:#x} -- {}", tid, eip, self);
                self.dq.push(thread);
            }
        } else {
            log!(
                LogLevel::LogWarn,
                "HURDLE VIOLATION: thread {} descheduling but not on runqueue",
                tid
            );
        }
    }

    pub fn set_action(&mut self, flag: Action) {
        let cur = self.current_mut();
        // a thread is forking, vanishing, or sleeping, never two at once
        let lifecycle = Action::FORKING | Action::VANISHING | Action::SLEEPING;
        if lifecycle.contains(flag) && cur.action.intersects(lifecycle) {
            log!(
                LogLevel::LogWarn,
                "HURDLE VIOLATION: thread {} setting {:?} while {:?}",
                cur.tid,
                flag,
                cur.action & lifecycle
            );
        }
        cur.action.insert(flag);
    }

    pub fn clear_action(&mut self, flag: Action) {
        let cur = self.current_mut();
        if !cur.action.contains(flag) {
            log!(
                LogLevel::LogWarn,
                "HURDLE VIOLATION: clearing {:?} on thread {} which lacks it",
                flag,
                cur.tid
            );
        }
        cur.action.remove(flag);
    }

    pub fn lockset_add(&mut self, space: AddrSpace, addr: u32, kind: LockKind) {
        self.current_mut().locks_mut(space).add(addr, kind);
    }

    /// Removes a lock from the current thread's set. On a miss: warn about
    /// apparent lock handoff, optionally search every other thread, and
    /// treat a kernel-space miss as fatal (bad annotations are our problem;
    /// user guests get the benefit of the doubt).
    pub fn lockset_remove(
        &mut self,
        space: AddrSpace,
        addr: u32,
        kind: LockKind,
        allow_handoff: bool,
    ) {
        if self.current_mut().locks_mut(space).remove(addr, kind) {
            return;
        }

        log!(
            LogLevel::LogWarn,
            "WARNING: lock handoff with TID {} unlocking {:#x}; data race tracking may be wrong",
            self.cur,
            addr
        );

        if allow_handoff {
            let found = self
                .rq
                .iter_mut()
                .chain(self.dq.iter_mut())
                .chain(self.sq.iter_mut())
                .any(|t| t.locks_mut(space).remove(addr, kind));
            if found {
                return;
            }
        }

        log!(
            LogLevel::LogWarn,
            "WARNING: couldn't find unlock()ed lock {:#x} in any lockset; \
             likely incorrect annotations (forgot mutex_trylock?)",
            addr
        );
        if space == AddrSpace::Kern {
            fatal!("kernel lockset desynchronized on unlock of {:#x}", addr);
        }
    }

    /// Fasttrack acquire: pull the lock's release clock into the current
    /// thread.
    pub fn vc_acquire(&mut self, lock_addr: u32) {
        let clock = self.lock_clocks.find(lock_addr).cloned();
        if let Some(c) = clock {
            self.current_mut().clock.merge(&c);
        }
    }

    /// Fasttrack release: publish the current thread's clock on the lock
    /// and step the thread into its next epoch.
    pub fn vc_release(&mut self, lock_addr: u32) {
        let tid = self.cur;
        let mut clock = self.current().clock.clone();
        self.lock_clocks.release(&mut clock, tid, lock_addr);
        self.current_mut().clock = clock;
    }

    /// After a rewind the replica state comes from the snapshot; anything
    /// about in-flight scheduling belongs to the abandoned branch.
    pub fn recover(&mut self) {
        self.schedule_in_flight = None;
        self.context_switch_pending = false;
    }
}

impl fmt::Display for ThreadTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (i, t) in self.rq.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t.tid)?;
            if t.action.contains(Action::HANDLING_TIMER) {
                write!(f, "t")?;
            }
        }
        write!(f, "] ((")?;
        for (i, t) in self.dq.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t.tid)?;
        }
        write!(f, ")) {{")?;
        for (i, t) in self.sq.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t.tid)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ThreadTable {
        ThreadTable::new(&[1, 2], 1)
    }

    #[test]
    fn fork_creates_on_runqueue() {
        let mut s = table();
        s.set_action(Action::FORKING);
        s.on_thread_runnable(5, 0x1000);
        assert!(s.on_runqueue(5));
        s.clear_action(Action::FORKING);
        // each thread is on exactly one queue
        assert_eq!(s.alive_tids().len(), 3);
    }

    #[test]
    fn deschedule_then_wake_moves_between_queues() {
        let mut s = table();
        s.on_thread_descheduling(2, 0x1000);
        assert!(!s.on_runqueue(2));
        assert_eq!(s.runnable_tids(), vec![1]);
        s.on_thread_runnable(2, 0x1004);
        assert!(s.on_runqueue(2));
    }

    #[test]
    fn sleeping_thread_goes_to_sleep_queue() {
        let mut s = table();
        s.observe_current(2, 0x1000);
        s.set_action(Action::SLEEPING);
        s.on_thread_descheduling(2, 0x1004);
        assert!(s.on_sleep_queue(2));
        // sleepers still count as runnable candidates
        assert_eq!(s.runnable_tids(), vec![1, 2]);
    }

    #[test]
    fn vanished_thread_retained_until_another_runs() {
        let mut s = table();
        s.set_action(Action::VANISHING);
        s.on_thread_descheduling(1, 0x1000);
        // still addressable as current
        assert_eq!(s.current().tid, 1);
        s.observe_current(2, 0x1008);
        assert_eq!(s.current().tid, 2);
        // off every queue, but its clock stays reachable
        assert!(!s.alive_tids().contains(&1));
        assert!(s.thread(1).is_some());
    }

    #[test]
    fn pending_switch_resolves_on_runnable() {
        let mut s = table();
        s.set_action(Action::FORKING);
        // tcb switched to a thread we have not seen yet
        s.observe_current(7, 0x2000);
        assert_eq!(s.current_tid(), 1);
        s.on_thread_runnable(7, 0x2004);
        assert_eq!(s.current_tid(), 7);
    }

    #[test]
    fn kernel_unlock_miss_is_fatal() {
        let mut s = table();
        s.lockset_add(AddrSpace::Kern, 0x3000, LockKind::Mutex);
        s.lockset_remove(AddrSpace::Kern, 0x3000, LockKind::Mutex, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            s.lockset_remove(AddrSpace::Kern, 0x4000, LockKind::Mutex, false);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn user_unlock_miss_tolerated() {
        let mut s = table();
        s.lockset_remove(AddrSpace::User, 0x4000, LockKind::Mutex, false);
        assert!(s.current().user_locks.is_empty());
    }

    #[test]
    fn handoff_searches_other_threads() {
        let mut s = table();
        s.thread_mut(2).unwrap().user_locks.add(0x5000, LockKind::Mutex);
        s.lockset_remove(AddrSpace::User, 0x5000, LockKind::Mutex, true);
        assert!(s.thread(2).unwrap().user_locks.is_empty());
    }
}

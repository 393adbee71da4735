use crate::arbiter::{Arbiter, PpKind, PpQuery};
use crate::dpor::update_dpor;
use crate::estimate::estimate;
use crate::explore::explore;
use crate::found_a_bug::{write_trace_file, BugKind, BugReport};
use crate::lockset::LockKind;
use crate::log::LogLevel;
use crate::machine::{
    decode_software_interrupt, opcodes_are_atomic_swap, read_stack, read_word, Event, Machine,
    TRIPLE_FAULT_EXCEPTION,
};
use crate::memory::{AccessContext, ChunkIdInfo, DataRaceTable, HeapChunk, MemState};
use crate::messaging::{should_abort, JobChannel, OutputMessage};
use crate::pp::PpConfig;
use crate::profile::{AddrSpace, GuestEvent, GuestProfile, ReschedKind};
use crate::save::SaveState;
use crate::schedule::{Action, ThreadTable};
use crate::stack::StackTrace;
use crate::testcase::TestState;
use crate::tree::{NodeId, Snapshot};
use crate::user_sync::{UserSyncState, YieldProgress, TOO_MANY_YIELDS};
use std::path::PathBuf;
use std::time::Instant;

pub const EXIT_NO_KNOWN_BUG: i32 = 0;
pub const EXIT_BUG_FOUND: i32 = 1;
pub const EXIT_USAGE_ERROR: i32 = 2;
pub const EXIT_CRASHED: i32 = 3;

/// How many transitions deeper than the average branch before we call the
/// branch stuck.
const PROGRESS_DEPTH_FACTOR: u64 = 20;
/// How many branches before the average is stable enough to judge an
/// abnormally deep branch.
const PROGRESS_MIN_BRANCHES: u64 = 20;
/// How many times longer than the average transition before we proclaim no
/// progress.
const PROGRESS_TRIGGER_FACTOR: u64 = 2000;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub test_name: String,
    /// Where bug traces get written.
    pub trace_dir: PathBuf,
    /// Quit on the first bug instead of exploring the remaining branches.
    pub stop_on_first_bug: bool,
    pub progress_trigger_factor: u64,
    pub progress_depth_factor: u64,
    pub progress_min_branches: u64,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            test_name: String::new(),
            trace_dir: std::env::temp_dir(),
            stop_on_first_bug: true,
            progress_trigger_factor: PROGRESS_TRIGGER_FACTOR,
            progress_depth_factor: PROGRESS_DEPTH_FACTOR,
            progress_min_branches: PROGRESS_MIN_BRANCHES,
        }
    }
}

/// Which memory state an access gets recorded into: the live one, or the
/// saved one of the previous transition while a schedule is in flight.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum TargetMem {
    Live,
    Saved(NodeId),
}

/// The exploration engine. Owns every piece of checker state and is driven
/// synchronously by the machine, once per event. It never owns the
/// machine; all steering goes through the `Machine` trait.
pub struct Engine {
    config: EngineConfig,
    profile: Box<dyn GuestProfile>,
    pps: PpConfig,
    channel: Box<dyn JobChannel>,

    sched: ThreadTable,
    test: TestState,
    kern_mem: MemState,
    user_mem: MemState,
    user_sync: UserSyncState,
    arbiter: Arbiter,
    save: SaveState,
    races: DataRaceTable,

    eip: u32,
    /// Instructions along the current branch (rewound with it).
    trigger_count: u64,
    /// Instructions ever executed (never rewound).
    absolute_trigger_count: u64,
    transition_start_trigger: u64,

    /// Heap tracking waits for the guest to finish early boot.
    mem_tracking_started: bool,
    /// The one user address space under test, once seen.
    user_cr3: Option<u32>,

    /// Rewound to a preemption point; consume the queued choice when the
    /// machine re-delivers it instead of snapshotting again.
    pending_jump_resume: bool,

    bugs_found: u32,
    start_instant: Instant,
    last_pp_instant: Instant,
    done: bool,
}

impl Engine {
    pub fn new(
        profile: Box<dyn GuestProfile>,
        pps: PpConfig,
        mut channel: Box<dyn JobChannel>,
        config: EngineConfig,
    ) -> Engine {
        let sched = ThreadTable::new(&profile.initial_runqueue(), profile.init_tid());
        channel.send(OutputMessage::ThunderbirdsAreGo);
        log!(LogLevel::LogInfo, "welcome; ready to explore");
        Engine {
            config,
            profile,
            pps,
            channel,
            sched,
            test: TestState::new(),
            kern_mem: MemState::new(AddrSpace::Kern),
            user_mem: MemState::new(AddrSpace::User),
            user_sync: UserSyncState::new(),
            arbiter: Arbiter::new(),
            save: SaveState::new(),
            races: DataRaceTable::new(),
            eip: 0,
            trigger_count: 0,
            absolute_trigger_count: 0,
            transition_start_trigger: 0,
            mem_tracking_started: false,
            user_cr3: None,
            pending_jump_resume: false,
            bugs_found: 0,
            start_instant: Instant::now(),
            last_pp_instant: Instant::now(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn bugs_found(&self) -> u32 {
        self.bugs_found
    }

    pub fn save_state(&self) -> &SaveState {
        &self.save
    }

    /// Types the configured test name at the guest shell.
    pub fn launch_test(&mut self, m: &mut dyn Machine) {
        let name = self.config.test_name.clone();
        self.test.cause_test(m, &name);
    }

    /// Main entry point. Called for every instruction, memory access, and
    /// exception the simulator executes.
    pub fn on_event(&mut self, m: &mut dyn Machine, event: Event) {
        if self.done {
            return;
        }
        match event {
            Event::MemAccess {
                phys_addr,
                virt_addr,
                write,
            } => {
                if self.save.just_jumped {
                    // stray access from the last instruction of a past
                    // branch; our state is already rewound
                    return;
                }
                if let Some(bug) = self.mem_check_shared_access(m, phys_addr, virt_addr, write) {
                    self.found_a_bug(m, bug);
                }
            }
            Event::Exception { number } => self.check_exception(m, number),
            Event::Instruction { eip } => self.on_instruction(m, eip),
        }
    }

    fn on_instruction(&mut self, m: &mut dyn Machine, eip: u32) {
        self.eip = eip;
        if self.profile.user_memory(eip) {
            self.check_user_syscall(m, eip);
        }
        self.trigger_count += 1;
        self.absolute_trigger_count += 1;

        if self.save.just_jumped {
            self.sched.recover();
            self.save.just_jumped = false;
        }

        let guest_event = self.profile.classify(m, eip);

        // mirror the guest's current-thread pointer
        if self.sched.guest_init_done {
            let new_tid = self.profile.current_tid(m);
            self.sched.observe_current(new_tid, eip);
        }

        if let Some(ev) = guest_event {
            if let Some(bug) = self.apply_guest_event(m, eip, ev) {
                self.found_a_bug(m, bug);
                return;
            }
        }
        if self.done {
            return;
        }

        self.check_test_state(m);
        if self.done || self.save.just_jumped {
            return;
        }

        self.maybe_preemption_point(m, eip, guest_event);
    }

    /// Tracks `int $n` at user eips; the value is live while the syscall
    /// executes and clears at the next user-mode instruction.
    fn check_user_syscall(&mut self, m: &mut dyn Machine, eip: u32) {
        if !self.sched.guest_init_done {
            return;
        }
        match decode_software_interrupt(m, eip) {
            Some(number) => {
                log!(
                    LogLevel::LogDebug,
                    "TID {} makes syscall {:#x}",
                    self.sched.current_tid(),
                    number
                );
                self.sched.current_mut().most_recent_syscall = number;
                if self.profile.syscall_is_yield(number) {
                    self.user_sync.record_user_yield();
                }
            }
            None => self.sched.current_mut().most_recent_syscall = 0,
        }
    }

    fn check_exception(&mut self, m: &mut dyn Machine, number: u32) {
        if number == TRIPLE_FAULT_EXCEPTION {
            let bug = BugReport::new(BugKind::TripleFault, "Triple fault!".to_string());
            self.found_a_bug(m, bug);
        } else if number < 32 {
            log!(
                LogLevel::LogDebug,
                "exception #{} taken at {:#x}",
                number,
                self.eip
            );
            if self.sched.guest_init_done {
                self.sched.current_mut().most_recent_syscall = number;
            }
        } else {
            log!(
                LogLevel::LogDebug,
                "vector #{} (syscall or interrupt) at {:#x}",
                number,
                self.eip
            );
        }
    }

    fn apply_guest_event(
        &mut self,
        m: &mut dyn Machine,
        eip: u32,
        ev: GuestEvent,
    ) -> Option<BugReport> {
        use GuestEvent::*;
        match ev {
            SchedInitDone => {
                self.sched.guest_init_done = true;
                log!(LogLevel::LogInfo, "guest scheduler is up");
            }
            KernelMainEntered => self.mem_tracking_started = true,

            TimerEntering => self.sched.set_action(Action::HANDLING_TIMER),
            TimerExiting => self.sched.clear_action(Action::HANDLING_TIMER),
            ContextSwitchEntering => self.sched.set_action(Action::CONTEXT_SWITCH),
            ContextSwitchExiting => self.sched.clear_action(Action::CONTEXT_SWITCH),
            ForkEntering => self.sched.set_action(Action::FORKING),
            ForkExiting => self.sched.clear_action(Action::FORKING),
            VanishEntering => self.sched.set_action(Action::VANISHING),
            ReadlineEntering => {
                self.sched.set_action(Action::READLINING);
                self.user_sync.record_user_yield_activity();
            }
            ReadlineExiting => self.sched.clear_action(Action::READLINING),

            VoluntaryResched { kind } => match kind {
                ReschedKind::Yield => {
                    if self.profile.user_memory(eip) {
                        self.user_sync.record_user_yield();
                    }
                }
                ReschedKind::Sleep => {
                    self.sched.set_action(Action::SLEEPING);
                    self.user_sync.record_user_yield_activity();
                }
                ReschedKind::Deschedule => self.user_sync.record_user_yield_activity(),
            },

            VmUserCopyEntering => self.sched.set_action(Action::VM_USER_COPY),
            VmUserCopyExiting => self.sched.clear_action(Action::VM_USER_COPY),
            UserMallocWrapperEntering => self.sched.set_action(Action::USER_MALLOC_WRAPPER),
            UserMallocWrapperExiting => self.sched.clear_action(Action::USER_MALLOC_WRAPPER),

            ThreadRunnable { tid } => {
                self.sched.on_thread_runnable(tid, eip);
                self.user_sync.record_user_yield_activity();
            }
            ThreadDescheduling { tid } => self.sched.on_thread_descheduling(tid, eip),

            AllocEntering { .. } | AllocExiting { .. } | FreeEntering { .. }
            | FreeExiting { .. } | ReallocEntering { .. } | ReallocExiting { .. }
            | MmInitEntering { .. } | MmInitExiting { .. } => {
                return self.mem_wrapper_event(m, ev);
            }

            LockEntering { addr, .. } => {
                let last_call = read_stack(m, 0);
                let cur = self.sched.current_mut();
                cur.last_call = last_call;
                cur.action.insert(Action::MUTEX_LOCKING);
                cur.blocked_on_addr = Some(addr);
                self.user_sync.record_user_yield_activity();
            }
            LockExiting { space, addr, kind } => {
                let cur = self.sched.current_mut();
                cur.action.remove(Action::MUTEX_LOCKING);
                cur.blocked_on_addr = None;
                // a semaphore orders its waiters after its signalers but
                // excludes nobody; it synchronizes without joining the
                // lockset
                if kind != LockKind::Sem {
                    self.sched.lockset_add(space, addr, kind);
                }
                self.sched.vc_acquire(addr);
            }
            UnlockEntering { addr, kind, .. } => {
                let last_call = read_stack(m, 0);
                let cur = self.sched.current_mut();
                cur.last_call = last_call;
                cur.action.insert(Action::MUTEX_UNLOCKING);
                cur.pending_unlock = Some((addr, kind));
                self.user_sync.record_user_yield_activity();
            }
            UnlockExiting { space } => {
                let pending = {
                    let cur = self.sched.current_mut();
                    cur.action.remove(Action::MUTEX_UNLOCKING);
                    cur.pending_unlock.take()
                };
                if let Some((addr, kind)) = pending {
                    if kind != LockKind::Sem {
                        let allow_handoff = self.profile.allow_lock_handoff();
                        self.sched.lockset_remove(space, addr, kind, allow_handoff);
                    }
                    self.sched.vc_release(addr);
                }
            }
            CondWaitEntering { .. } => {
                // the wrapper's own mutex unlock/lock are watched and do
                // the lockset and clock work
                self.user_sync.record_user_yield_activity();
            }

            SyncInitEntering { addr } => {
                let cur = self.sched.current_mut();
                cur.action.insert(Action::SYNC_INITING);
                cur.sync_init_addr = Some(addr);
            }
            SyncInitExiting => {
                let cur = self.sched.current_mut();
                cur.action.remove(Action::SYNC_INITING);
                cur.sync_init_addr = None;
            }
            SyncDestroyEntering { addr } => {
                let cur = self.sched.current_mut();
                cur.action.insert(Action::SYNC_DESTROYING);
                cur.sync_destroy_addr = Some(addr);
            }
            SyncDestroyExiting => {
                let addr = {
                    let cur = self.sched.current_mut();
                    cur.action.remove(Action::SYNC_DESTROYING);
                    cur.sync_destroy_addr.take()
                };
                if let Some(addr) = addr {
                    self.user_sync.mutex_destroy(addr);
                }
            }

            Panicked { space } => return self.check_panic(m, eip, space),
            ReportEndFail => {
                return Some(BugReport::new(
                    BugKind::TestReportedFailure,
                    "User test program reported failure!".to_string(),
                ));
            }
        }
        None
    }

    fn check_panic(
        &mut self,
        m: &mut dyn Machine,
        eip: u32,
        space: AddrSpace,
    ) -> Option<BugReport> {
        let message = self
            .profile
            .panic_message(m, eip)
            .unwrap_or_else(|| "(no message)".to_string());
        let testing_user = self.profile.testing_userspace();
        match space {
            AddrSpace::Kern => {
                if testing_user {
                    Some(wrong_panic("kernel", "user"))
                } else {
                    Some(BugReport::new(
                        BugKind::KernelPanic,
                        format!("KERNEL PANIC: {}", message),
                    ))
                }
            }
            AddrSpace::User => {
                let tid = self.sched.current_tid();
                if tid == self.profile.init_tid()
                    || tid == self.profile.shell_tid()
                    || Some(tid) == self.profile.idle_tid()
                {
                    return None;
                }
                if testing_user {
                    Some(BugReport::new(
                        BugKind::UserspacePanic,
                        format!("USERSPACE PANIC: {}", message),
                    ))
                } else {
                    Some(wrong_panic("user", "kernel"))
                }
            }
        }
    }

    /// Allocator wrapper tracking for both spaces (heap bookkeeping plus
    /// the user-mutex structure learning hook).
    fn mem_wrapper_event(&mut self, m: &mut dyn Machine, ev: GuestEvent) -> Option<BugReport> {
        use GuestEvent::*;
        if !self.mem_tracking_started {
            return None;
        }
        let allow_reentrant = self.profile.allow_reentrant_malloc_free();

        match ev {
            AllocEntering { space, page, size } => {
                let mem = self.mem_mut(space);
                if mem.in_mm_init {
                    return None;
                }
                let mut flags = self.sched.current().alloc_flags(space).clone();
                let result = self.mem_mut(space).alloc_enter(&mut flags, page, size);
                *self.sched.current_mut().alloc_flags_mut(space) = flags;
                if let Err(description) = result {
                    if allow_reentrant {
                        log!(LogLevel::LogWarn, "{} (tolerated by policy)", description);
                    } else {
                        return Some(BugReport::new(BugKind::ReentrantAllocator, description));
                    }
                }
            }
            AllocExiting { space, page, base } => {
                let tid = self.sched.current_tid();
                let trace = StackTrace::capture(m, tid);
                let mut flags = self.sched.current().alloc_flags(space).clone();
                let size = flags.alloc_request_size;
                self.mem_mut(space).alloc_exit(&mut flags, page, base, trace);
                *self.sched.current_mut().alloc_flags_mut(space) = flags;
                // a malloc inside mutex_init reveals the mutex's
                // dynamically-allocated parts
                if space == AddrSpace::User && base != 0 {
                    let init_addr = {
                        let cur = self.sched.current();
                        if cur.action.contains(Action::SYNC_INITING) {
                            cur.sync_init_addr
                        } else {
                            None
                        }
                    };
                    if let Some(lock_addr) = init_addr {
                        self.user_sync
                            .learn_malloced_mutex_structure(lock_addr, base, size);
                    }
                }
            }
            FreeEntering { space, page, base } => {
                return self.free_enter(m, space, page, base, allow_reentrant);
            }
            FreeExiting { space, page } => {
                let flags = self.sched.current_mut().alloc_flags_mut(space);
                let in_free = if page {
                    &mut flags.in_page_free
                } else {
                    &mut flags.in_free
                };
                if !*in_free {
                    log!(
                        LogLevel::LogWarn,
                        "HURDLE VIOLATION: free exit without free entry"
                    );
                }
                *in_free = false;
            }
            ReallocEntering { space, .. } => {
                let flags = self.sched.current_mut().alloc_flags_mut(space);
                if flags.in_alloc || flags.in_free || flags.in_realloc {
                    let description = format!(
                        "Realloc (in {}) reentered the allocator!",
                        space.name()
                    );
                    if allow_reentrant {
                        log!(LogLevel::LogWarn, "{} (tolerated by policy)", description);
                    } else {
                        return Some(BugReport::new(BugKind::ReentrantAllocator, description));
                    }
                }
                flags.in_realloc = true;
            }
            ReallocExiting { space, .. } => {
                self.sched.current_mut().alloc_flags_mut(space).in_realloc = false;
            }
            MmInitEntering { space } => self.mem_mut(space).in_mm_init = true,
            MmInitExiting { space } => self.mem_mut(space).in_mm_init = false,
            _ => unreachable!("non-allocator event in mem_wrapper_event"),
        }
        None
    }

    fn free_enter(
        &mut self,
        m: &mut dyn Machine,
        space: AddrSpace,
        page: bool,
        base: u32,
        allow_reentrant: bool,
    ) -> Option<BugReport> {
        {
            let flags = self.sched.current().alloc_flags(space);
            let (in_alloc, in_free) = if page {
                (flags.in_page_alloc, flags.in_page_free)
            } else {
                (flags.in_alloc, flags.in_free)
            };
            if in_alloc || in_free {
                let description = format!(
                    "Free (in {}) reentered {}!",
                    space.name(),
                    if in_alloc { "Malloc" } else { "Free" }
                );
                if !allow_reentrant {
                    return Some(BugReport::new(BugKind::ReentrantAllocator, description));
                }
                log!(LogLevel::LogWarn, "{} (tolerated by policy)", description);
            }
        }
        {
            let flags = self.sched.current_mut().alloc_flags_mut(space);
            if page {
                flags.in_page_free = true;
            } else {
                flags.in_free = true;
            }
        }

        if base == 0 {
            log!(
                LogLevel::LogInfo,
                "Free() NULL (in {}); ok, I guess...",
                space.name()
            );
            return None;
        }

        let removed = self.mem_mut(space).remove_live(page, base);
        match removed {
            None => match self.find_freed_chunk(space, base) {
                Some((chunk, after, before)) => {
                    let details = freed_chunk_details(&chunk, &self.save, after, before);
                    Some(BugReport::with_details(
                        BugKind::DoubleFree,
                        format!("DOUBLE FREE (in {}) of {:#x}!", space.name(), base),
                        details,
                    ))
                }
                None => Some(BugReport::new(
                    BugKind::FreeOfUnallocated,
                    format!(
                        "Attempted to free (in {}) {:#x}, which was never malloced!",
                        space.name(),
                        base
                    ),
                )),
            },
            Some(chunk) if chunk.base != base => Some(BugReport::new(
                BugKind::InteriorPointerFree,
                format!(
                    "Attempted to free {:#x} (in {}), which was not malloced, \
                     but contained within another malloced block: [{:#x} | {}]",
                    base,
                    space.name(),
                    chunk.base,
                    chunk.len
                ),
            )),
            Some(chunk) => {
                let tid = self.sched.current_tid();
                let trace = StackTrace::capture(m, tid);
                log!(
                    LogLevel::LogDebug,
                    "Free() chunk {:#x}, in {}",
                    base,
                    space.name()
                );
                self.mem_mut(space).free_commit(chunk, trace);
                None
            }
        }
    }

    fn mem_mut(&mut self, space: AddrSpace) -> &mut MemState {
        match space {
            AddrSpace::Kern => &mut self.kern_mem,
            AddrSpace::User => &mut self.user_mem,
        }
    }

    fn mem(&self, space: AddrSpace) -> &MemState {
        match space {
            AddrSpace::Kern => &self.kern_mem,
            AddrSpace::User => &self.user_mem,
        }
    }

    /// Searches the freed tree of the live state and then of every
    /// ancestor snapshot, oldest-miss-first, mirroring how the chunk
    /// looked whenever it was freed. Returns the chunk and the two nodes
    /// it was freed between (None = root / latest respectively).
    fn find_freed_chunk(
        &self,
        space: AddrSpace,
        addr: u32,
    ) -> Option<(HeapChunk, Option<NodeId>, Option<NodeId>)> {
        let mut inspecting: Option<NodeId> = None;
        let mut parent = self.save.current;
        let mut mem = self.mem(space);

        loop {
            if let Some(c) = mem.freed.containing(addr) {
                return Some((c.clone(), parent, inspecting));
            }
            match parent {
                None => return None,
                Some(node) => {
                    inspecting = Some(node);
                    parent = self.save.tree.node(node).parent;
                    let snapshot = &self.save.tree.node(node).snapshot;
                    mem = match space {
                        AddrSpace::Kern => &snapshot.kern_mem,
                        AddrSpace::User => &snapshot.user_mem,
                    };
                }
            }
        }
    }

    /// The user heap tracking only works for the one address space under
    /// test; init, shell, and idle (and everything in a kernel test) are
    /// ignored.
    fn ignore_user_access(&mut self, m: &mut dyn Machine) -> bool {
        if !self.profile.testing_userspace() {
            return true;
        }
        let tid = self.sched.current_tid();
        if tid == self.profile.init_tid()
            || tid == self.profile.shell_tid()
            || Some(tid) == self.profile.idle_tid()
        {
            return true;
        }
        let cr3 = m.read_register(crate::machine::Register::Cr3);
        match self.user_cr3 {
            None => {
                log!(
                    LogLevel::LogDebug,
                    "registered cr3 value {:#x} for userspace tid {}",
                    cr3,
                    tid
                );
                self.user_cr3 = Some(cr3);
                false
            }
            Some(known) if known == cr3 => false,
            Some(known) => {
                fatal!(
                    "memory tracking for more than 1 user address space is \
                     unsupported (tracking {:#x}, current {:#x}); make sure \
                     the test case doesn't fork()",
                    known,
                    cr3
                );
            }
        }
    }

    /// The per-access workhorse: decides which space and state an access
    /// belongs to, gives the scheduler and allocator their free passes,
    /// catches use-after-free, and records everything else for DPOR.
    fn mem_check_shared_access(
        &mut self,
        m: &mut dyn Machine,
        phys_addr: u32,
        virt_addr: u32,
        write: bool,
    ) -> Option<BugReport> {
        if !self.sched.guest_init_done {
            return None;
        }
        let eip = self.eip;

        // Atomic swaps that store back the value they read must not count
        // as "another thread made progress" for spinner unblocking.
        let mut xchg_wont_modify = false;
        if opcodes_are_atomic_swap(m, eip) {
            let addr = if virt_addr != 0 { virt_addr } else { phys_addr };
            let val = read_word(m, addr);
            if write {
                if self.user_mem.during_xchg {
                    xchg_wont_modify = self.user_mem.last_xchg_read == val;
                }
            } else {
                self.user_mem.during_xchg = true;
                self.user_mem.last_xchg_read = val;
                self.user_sync.xchg_count += 1;
            }
        }

        let in_kernel_code = self.profile.kernel_memory(eip)
            && !self
                .sched
                .current()
                .action
                .contains(Action::VM_USER_COPY);

        let (space, addr) = if in_kernel_code {
            let addr = phys_addr;
            // the scheduler's own accesses would look racy; free pass
            {
                let cur = self.sched.current();
                if self.profile.in_scheduler(eip)
                    || self.profile.scheduler_access(addr)
                    || cur.action.contains(Action::HANDLING_TIMER)
                    || cur.action.contains(Action::CONTEXT_SWITCH)
                {
                    return None;
                }
            }
            if self.profile.testing_userspace() {
                // the shm for the space not under test must stay empty;
                // only backchannel syscalls get charged to the user space
                let syscall = self.sched.current().most_recent_syscall;
                if self
                    .profile
                    .user_backchannel_syscalls()
                    .contains(&syscall)
                {
                    if write && !xchg_wont_modify {
                        self.check_unblock_yield_loop(addr);
                    }
                    (AddrSpace::User, addr)
                } else {
                    return None;
                }
            } else {
                (AddrSpace::Kern, addr)
            }
        } else {
            if self.profile.kernel_memory(phys_addr) {
                // `int` pushes to the kernel stack from user mode
                return None;
            }
            if self.ignore_user_access(m) {
                return None;
            }
            if virt_addr == 0 {
                // page-table read by the walker
                if write {
                    log!(
                        LogLevel::LogWarn,
                        "HURDLE VIOLATION: userspace write to page table?"
                    );
                }
                return None;
            }
            if write && !xchg_wont_modify {
                self.check_user_mutex_access(virt_addr);
                self.check_unblock_yield_loop(virt_addr);
            }
            // a suspected spinner's reads are what another thread must
            // write to unblock it
            {
                let cur = self.sched.current_mut();
                if cur.user_yield.loop_count > 0 {
                    cur.user_yield.observed.insert(virt_addr);
                }
            }
            (AddrSpace::User, virt_addr)
        };

        // Right after a choice point, the chosen thread may still be in
        // flight; accesses by the previous transition's thread belong to
        // the saved state, and accesses by unrelated threads are dropped.
        let target = if self.sched.schedule_in_flight.is_some() {
            let current_node = self.save.current?;
            let prev_tid = self.save.tree.node(current_node).chosen_thread;
            if prev_tid != Some(self.sched.current_tid()) {
                return None;
            }
            TargetMem::Saved(current_node)
        } else {
            TargetMem::Live
        };

        // the allocator has a free pass to its own accesses
        {
            let flags = self.sched.current().alloc_flags(space);
            if self.mem(space).in_mm_init || flags.in_any() {
                return None;
            }
        }
        // userspace malloc wrappers are exempt from conflict tracking but
        // still get use-after-free checking
        let do_add_shm = !self
            .sched
            .current()
            .action
            .contains(Action::USER_MALLOC_WRAPPER);

        let in_heap = match space {
            AddrSpace::Kern => self.profile.kern_address_in_heap(addr),
            AddrSpace::User => self.profile.user_address_in_heap(addr),
        };
        let is_global = match space {
            AddrSpace::Kern => self.profile.kern_address_global(addr),
            AddrSpace::User => self.profile.user_address_global(addr),
        };

        let chunk_ids = if in_heap {
            let chunk_id = match target {
                TargetMem::Live => self.mem(space).find_alloced_chunk(addr).map(|c| c.id),
                TargetMem::Saved(id) => {
                    let snapshot = &self.save.tree.node(id).snapshot;
                    let mem = match space {
                        AddrSpace::Kern => &snapshot.kern_mem,
                        AddrSpace::User => &snapshot.user_mem,
                    };
                    mem.find_alloced_chunk(addr).map(|c| c.id)
                }
            };
            match chunk_id {
                Some(id) => ChunkIdInfo::Chunk(id),
                None => return Some(self.use_after_free(space, addr, write)),
            }
        } else {
            ChunkIdInfo::NotInHeap
        };

        if !do_add_shm {
            return None;
        }
        // kernel tests record global and foreign-stack accesses; user
        // tests record everything including own stacks, for the sake of
        // yield-loop reasoning
        if space == AddrSpace::Kern && !in_heap && !is_global {
            return None;
        }

        let ctx = {
            let cur = self.sched.current();
            AccessContext {
                eip,
                write,
                during_init: cur.action.contains(Action::SYNC_INITING),
                during_destroy: cur.action.contains(Action::SYNC_DESTROYING),
                interrupts_enabled: crate::machine::interrupts_enabled(m),
                last_call: cur.last_call,
                most_recent_syscall: cur.most_recent_syscall,
                chunk_ids,
                locks_held: cur.locks(space).clone(),
            }
        };
        match target {
            TargetMem::Live => self.mem_mut(space).add_shm(addr, write, &ctx),
            TargetMem::Saved(id) => {
                let snapshot = &mut self.save.tree.node_mut(id).snapshot;
                let mem = match space {
                    AddrSpace::Kern => &mut snapshot.kern_mem,
                    AddrSpace::User => &mut snapshot.user_mem,
                };
                mem.add_shm(addr, write, &ctx);
            }
        }
        None
    }

    fn use_after_free(&self, space: AddrSpace, addr: u32, write: bool) -> BugReport {
        let mut details = vec![format!(
            "Malloc() heap contents: {}",
            self.mem(space).malloc_heap
        )];
        if !self.mem(space).page_heap.is_empty() {
            details.push(format!(
                "Palloc() heap contents: {}",
                self.mem(space).page_heap
            ));
        }
        let what = if write { "write to" } else { "read from" };
        match self.find_freed_chunk(space, addr) {
            Some((chunk, after, before)) => {
                details.extend(freed_chunk_details(&chunk, &self.save, after, before));
                BugReport::with_details(
                    BugKind::UseAfterFree,
                    format!(
                        "USE AFTER FREE - {} {:#010x} at eip {:#010x}",
                        what, addr, self.eip
                    ),
                    details,
                )
            }
            None => {
                details.push(format!("{:#x} was never allocated...", addr));
                BugReport::with_details(
                    BugKind::InvalidHeapAccess,
                    format!(
                        "INVALID HEAP ACCESS (never allocated) - {} {:#010x} at eip {:#010x}",
                        what, addr, self.eip
                    ),
                    details,
                )
            }
        }
    }

    /// An open-coded unlock write to a known user mutex unblocks spinning
    /// contenders.
    fn check_user_mutex_access(&mut self, addr: u32) {
        let lock_addrs: Vec<u32> = self
            .user_sync
            .mutexes
            .iter()
            .map(|mx| mx.addr)
            .filter(|&lock| self.user_sync.lock_contains_addr(lock, addr))
            .collect();
        if lock_addrs.is_empty() {
            return;
        }
        let cur_tid = self.sched.current_tid();
        for tid in self.sched.alive_tids() {
            if tid == cur_tid {
                continue;
            }
            let t = self.sched.thread_mut(tid).unwrap();
            if let Some(blocked_on) = t.blocked_on_addr {
                if lock_addrs.contains(&blocked_on) {
                    t.blocked_on_addr = None;
                }
            }
        }
    }

    /// Another thread wrote something a yield-blocked spinner had read;
    /// it may make progress now.
    fn check_unblock_yield_loop(&mut self, addr: u32) {
        let cur_tid = self.sched.current_tid();
        for tid in self.sched.alive_tids() {
            if tid == cur_tid {
                continue;
            }
            let t = self.sched.thread_mut(tid).unwrap();
            if (t.user_yield.is_blocked() || t.xchg_count > 0)
                && t.user_yield.observed.contains_key(addr)
            {
                log!(
                    LogLevel::LogDebug,
                    "write to {:#x} unblocks spinning tid {}",
                    addr,
                    tid
                );
                t.user_yield.unblock();
                t.xchg_count = 0;
            }
        }
    }

    fn check_test_state(&mut self, m: &mut dyn Machine) {
        let changed = self.test.update(&self.sched, &*self.profile);
        if changed {
            if self.test.test_is_running {
                self.test.start_kern_heap_size = self.kern_mem.heap_size;
                self.test.start_user_heap_size = self.user_mem.heap_size;
            } else if self.test.test_ever_caused {
                log!(LogLevel::LogInfo, "test case ended!");
                if let Some(bug) = self.leak_check() {
                    self.found_a_bug(m, bug);
                } else {
                    self.end_branch(m);
                }
            } else {
                log!(LogLevel::LogInfo, "ready to roll!");
                m.break_simulation();
            }
            return;
        }
        if let Some(bug) = self.ensure_progress() {
            self.found_a_bug(m, bug);
        }
    }

    fn leak_check(&self) -> Option<BugReport> {
        if self.test.start_kern_heap_size > self.kern_mem.heap_size {
            Some(BugReport::new(
                BugKind::KernelMemoryLeak,
                format!(
                    "KERNEL MEMORY LEAK ({} bytes)!",
                    self.test.start_kern_heap_size - self.kern_mem.heap_size
                ),
            ))
        } else if self.test.start_user_heap_size > self.user_mem.heap_size {
            Some(BugReport::new(
                BugKind::UserMemoryLeak,
                format!(
                    "USER MEMORY LEAK ({} bytes)!",
                    self.test.start_user_heap_size - self.user_mem.heap_size
                ),
            ))
        } else {
            None
        }
    }

    fn ensure_progress(&self) -> Option<BugReport> {
        // the 0th branch sets the averages; an expensive one-off operation
        // should fold into them, not trip the detector
        if self.save.total_jumps == 0 {
            return None;
        }
        let current = self.save.current?;

        let most_recent = self
            .trigger_count
            .saturating_sub(self.save.tree.node(current).trigger_count);
        let average = (self.save.total_triggers / self.save.total_choices.max(1)).max(1);
        if most_recent > average * self.config.progress_trigger_factor {
            log!(
                LogLevel::LogError,
                "{} instructions since last decision; average {}",
                most_recent,
                average
            );
            return Some(BugReport::new(
                BugKind::NoProgress,
                "NO PROGRESS (infinite loop?)".to_string(),
            ));
        }

        if self.save.total_jumps < self.config.progress_min_branches {
            return None;
        }
        let average_depth = (self.save.depth_total / (1 + self.save.total_jumps)).max(1);
        if (self.save.tree.node(current).depth as u64)
            > average_depth * self.config.progress_depth_factor
        {
            log!(
                LogLevel::LogError,
                "current branch depth {}; average depth {}",
                self.save.tree.node(current).depth,
                average_depth
            );
            return Some(BugReport::new(
                BugKind::NoProgress,
                "NO PROGRESS (stuck thread(s)?)".to_string(),
            ));
        }
        None
    }

    fn maybe_preemption_point(
        &mut self,
        m: &mut dyn Machine,
        eip: u32,
        guest_event: Option<GuestEvent>,
    ) {
        use GuestEvent::*;
        let sync_wrapper_entry = matches!(
            guest_event,
            Some(LockEntering { .. }) | Some(UnlockEntering { .. }) | Some(CondWaitEntering { .. })
        );
        // A thread coming off the runqueue under its own power (block,
        // sleep, vanish) ends its transition too: whoever runs next must
        // get a fresh one, or their accesses would be charged to the dead
        // transition and reorderings would never line up.
        let voluntary_resched = matches!(
            guest_event,
            Some(VoluntaryResched { .. }) | Some(ThreadDescheduling { .. })
        );

        if !self.sched.guest_init_done {
            return;
        }
        let tid = self.sched.current_tid();
        let st = StackTrace::capture(m, tid);
        let space = if self.profile.kernel_memory(eip) {
            AddrSpace::Kern
        } else {
            AddrSpace::User
        };
        let query = PpQuery {
            eip,
            space,
            sync_wrapper_entry,
            voluntary_resched,
            stack_trace: &st,
        };
        if let Some(kind) = self.arbiter.interested(&self.pps, &self.sched, &query) {
            self.handle_preemption_point(m, eip, kind, st);
        }
    }

    fn handle_preemption_point(
        &mut self,
        m: &mut dyn Machine,
        eip: u32,
        kind: PpKind,
        stack_trace: StackTrace,
    ) {
        // still flying toward a chosen thread: defer this PP and keep
        // firing timers until it lands
        if let Some(target) = self.sched.schedule_in_flight {
            if self.sched.current_tid() != target {
                m.delay_instruction_by_one();
                m.inject_timer_interrupt();
                return;
            }
            self.sched.schedule_in_flight = None;
        }

        // back at the PP we rewound to: the node exists, just re-choose
        if self.pending_jump_resume {
            self.pending_jump_resume = false;
            self.choose_and_preempt(m);
            return;
        }

        self.close_transition_yield_state();

        let snapshot = Snapshot {
            sched: self.sched.clone(),
            test: self.test.clone(),
            kern_mem: self.kern_mem.clone(),
            user_mem: self.user_mem.clone(),
            user_sync: self.user_sync.clone(),
        };
        let usecs = self.last_pp_instant.elapsed().as_micros() as u64;
        let speculative = kind.data_race_eip.is_some();
        let id = self.save.setjmp(
            m,
            snapshot,
            eip,
            self.trigger_count,
            self.trigger_count - self.transition_start_trigger,
            Some(stack_trace),
            !speculative,
            kind.data_race_eip,
            kind.voluntary,
            usecs,
        );

        update_dpor(
            &mut self.save.tree,
            &mut self.races,
            &mut *self.channel,
            &*self.profile,
            id,
            !self.pps.data_races.is_empty(),
            self.save.total_jumps,
        );

        // a fresh transition begins here
        self.kern_mem.reset_shm();
        self.user_mem.reset_shm();
        self.user_sync.xchg_count = 0;
        self.transition_start_trigger = self.trigger_count;
        self.last_pp_instant = Instant::now();

        self.choose_and_preempt(m);
    }

    /// Folds the ending transition into the current thread's yield-loop
    /// counters.
    fn close_transition_yield_state(&mut self) {
        let progress = self.user_sync.yield_progress;
        let xchgs = self.user_sync.xchg_count;
        let cur = self.sched.current_mut();
        match progress {
            YieldProgress::Yielded => {
                if cur.user_yield.loop_count < TOO_MANY_YIELDS {
                    cur.user_yield.loop_count += 1;
                }
                if cur.user_yield.loop_count == TOO_MANY_YIELDS {
                    // mark it so older snapshots of this spin read as
                    // blocked too
                    cur.user_yield.blocked = true;
                    log!(
                        LogLevel::LogInfo,
                        "tid {} is yield-loop blocked",
                        cur.tid
                    );
                }
            }
            YieldProgress::Activity => {
                cur.user_yield.unblock();
                cur.xchg_count = 0;
            }
            YieldProgress::NothingInteresting => {}
        }
        if xchgs > 0 && progress != YieldProgress::Activity {
            cur.xchg_count += 1;
        }
        self.user_sync.yield_progress = YieldProgress::NothingInteresting;
    }

    fn choose_and_preempt(&mut self, m: &mut dyn Machine) {
        match self.arbiter.choose(&self.sched) {
            Some((tid, our_choice)) => {
                log!(
                    LogLevel::LogDebug,
                    "chose tid {} ({}) at {:#x}",
                    tid,
                    if our_choice { "ours" } else { "queued" },
                    self.eip
                );
                self.save.next_tid = Some(tid);
                if tid != self.sched.current_tid() {
                    self.sched.schedule_in_flight = Some(tid);
                    m.inject_timer_interrupt();
                }
            }
            None => {
                if self.test.test_is_running {
                    let bug = BugReport::new(
                        BugKind::Deadlock,
                        "DEADLOCK! No runnable thread can make progress".to_string(),
                    );
                    self.found_a_bug(m, bug);
                } else {
                    m.break_simulation();
                }
            }
        }
    }

    /// A guest bug: write the trace, tell the driver, and either quit or
    /// move on to another branch.
    fn found_a_bug(&mut self, m: &mut dyn Machine, bug: BugReport) {
        self.bugs_found += 1;
        let filename = match write_trace_file(
            &self.config.trace_dir,
            &bug,
            &self.save,
            self.save.next_tid,
            self.eip,
            self.trigger_count,
            self.absolute_trigger_count,
        ) {
            Ok(path) => path.display().to_string(),
            Err(err) => {
                log!(LogLevel::LogError, "failed to write trace file: {}", err);
                String::from("(trace unavailable)")
            }
        };
        self.channel
            .send(OutputMessage::FoundABug { trace_filename: filename });

        if self.config.stop_on_first_bug {
            self.done = true;
            m.quit(EXIT_BUG_FOUND);
            return;
        }
        self.end_branch(m);
    }

    /// Terminates the current branch: checkpoint the final transition,
    /// refresh the estimate, honor abort requests, and either rewind to
    /// the next tagged sibling or finish.
    fn end_branch(&mut self, m: &mut dyn Machine) {
        self.close_transition_yield_state();
        let snapshot = Snapshot {
            sched: self.sched.clone(),
            test: self.test.clone(),
            kern_mem: self.kern_mem.clone(),
            user_mem: self.user_mem.clone(),
            user_sync: self.user_sync.clone(),
        };
        let usecs = self.last_pp_instant.elapsed().as_micros() as u64;
        let id = self.save.setjmp(
            m,
            snapshot,
            self.eip,
            self.trigger_count,
            self.trigger_count - self.transition_start_trigger,
            None,
            true,
            None,
            false,
            usecs,
        );
        update_dpor(
            &mut self.save.tree,
            &mut self.races,
            &mut *self.channel,
            &*self.profile,
            id,
            !self.pps.data_races.is_empty(),
            self.save.total_jumps,
        );
        self.kern_mem.reset_shm();
        self.user_mem.reset_shm();

        log!(
            LogLevel::LogInfo,
            "end of branch #{}",
            self.save.total_jumps + 1
        );
        self.send_estimate(id);

        if should_abort(&mut *self.channel) {
            log!(LogLevel::LogWarn, "abort requested by master process");
            self.log_tree_info();
            self.done = true;
            m.quit(EXIT_NO_KNOWN_BUG);
            return;
        }

        if !self.time_travel(m) {
            self.exploration_complete(m);
        }
    }

    fn send_estimate(&mut self, leaf: NodeId) {
        let root = match self.save.tree.root() {
            Some(root) => root,
            None => return,
        };
        let elapsed = self.start_instant.elapsed().as_micros() as u64;
        let result = estimate(
            &mut self.save.tree,
            root,
            leaf,
            self.save.total_jumps + 1,
            elapsed,
        );
        self.channel.send(OutputMessage::Estimate {
            proportion: result.proportion,
            branches: result.estimated_branches,
            total_usecs: result.estimated_total_usecs,
            elapsed_usecs: elapsed,
        });
    }

    /// Picks the next tagged-but-unexplored sibling and rewinds the
    /// machine and all checker state to its ancestor. Returns false when
    /// the tree is exhausted.
    fn time_travel(&mut self, m: &mut dyn Machine) -> bool {
        let current = match self.save.current {
            Some(id) => id,
            None => return false,
        };
        let (target, tid) = match explore(&mut self.save.tree, current) {
            Some(choice) => choice,
            None => return false,
        };

        let snapshot = self.save.longjmp(m, target);
        self.sched = snapshot.sched;
        self.test = snapshot.test;
        self.kern_mem = snapshot.kern_mem;
        self.user_mem = snapshot.user_mem;
        self.user_sync = snapshot.user_sync;
        // the records for the transition ending at the target live in its
        // snapshot; the new transition starts clean
        self.kern_mem.reset_shm();
        self.user_mem.reset_shm();
        self.user_sync.xchg_count = 0;

        self.arbiter.clear_choices();
        self.arbiter.append_choice(tid);
        self.pending_jump_resume = true;

        // the PP instruction re-executes and re-counts itself
        self.trigger_count = self.save.tree.node(target).trigger_count.saturating_sub(1);
        self.transition_start_trigger = self.save.tree.node(target).trigger_count;
        self.last_pp_instant = Instant::now();
        true
    }

    fn exploration_complete(&mut self, m: &mut dyn Machine) {
        self.log_tree_info();
        self.done = true;
        if self.bugs_found > 0 {
            m.quit(EXIT_BUG_FOUND);
        } else {
            log!(
                LogLevel::LogInfo,
                "**** Execution tree explored; you survived! ****"
            );
            m.quit(EXIT_NO_KNOWN_BUG);
        }
    }

    fn log_tree_info(&self) {
        log!(
            LogLevel::LogInfo,
            "total choices {}, total backtracks {}, total triggers {}, nodes {}",
            self.save.total_choices,
            self.save.total_jumps,
            self.save.total_triggers,
            self.save.tree.len()
        );
    }
}

fn wrong_panic(panicked: &str, expected: &str) -> BugReport {
    log!(
        LogLevel::LogError,
        "The {} panicked during a {}space test. This is more likely a \
         problem with the test configuration, or a reference kernel bug, \
         than a bug in your code.",
        panicked,
        expected
    );
    BugReport::new(
        BugKind::WrongPanic,
        format!(
            "Unexpected {} panic during {}space test",
            panicked, expected
        ),
    )
}

fn freed_chunk_details(
    chunk: &HeapChunk,
    save: &SaveState,
    after: Option<NodeId>,
    before: Option<NodeId>,
) -> Vec<String> {
    let describe = |id: Option<NodeId>, missing: &str| match id {
        Some(id) => {
            let node = save.tree.node(id);
            match node.chosen_thread {
                Some(tid) => format!("#{}/tid{}", node.depth, tid),
                None => format!("#{}/root", node.depth),
            }
        }
        None => missing.to_string(),
    };
    let mut details = vec![format!(
        "Heap block [{:#x} | {}] was allocated at: {}",
        chunk.base, chunk.len, chunk.alloc_trace
    )];
    let freed_at = match &chunk.free_trace {
        Some(trace) => format!("{}", trace),
        None => "(unknown)".to_string(),
    };
    details.push(format!(
        "...and, between preemptions {} and {}, freed at: {}",
        describe(after, "[root]"),
        describe(before, "[latest]"),
        freed_at
    ));
    details
}

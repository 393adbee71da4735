use crate::lockset::LockKind;
use crate::machine::Machine;
use crate::vector_clock::Tid;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddrSpace {
    Kern,
    User,
}

impl AddrSpace {
    pub fn name(self) -> &'static str {
        match self {
            AddrSpace::Kern => "kernel",
            AddrSpace::User => "userspace",
        }
    }
}

/// A watched occurrence in the guest, recognized from the current eip (and,
/// for the ones carrying values, from registers or the stack). The profile
/// implementation knows the guest's symbols and calling convention; the
/// engine only sees these.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GuestEvent {
    TimerEntering,
    TimerExiting,
    ContextSwitchEntering,
    ContextSwitchExiting,
    /// The guest scheduler finished setting itself up; the replica may
    /// start mirroring it.
    SchedInitDone,
    /// kernel_main reached; heap tracking may begin.
    KernelMainEntered,
    /// The current thread is in the path that spawns a new thread.
    ForkEntering,
    ForkExiting,
    VanishEntering,
    ReadlineEntering,
    ReadlineExiting,
    ThreadRunnable { tid: Tid },
    ThreadDescheduling { tid: Tid },

    AllocEntering { space: AddrSpace, page: bool, size: u32 },
    AllocExiting { space: AddrSpace, page: bool, base: u32 },
    FreeEntering { space: AddrSpace, page: bool, base: u32 },
    FreeExiting { space: AddrSpace, page: bool },
    ReallocEntering { space: AddrSpace, orig_base: u32, size: u32 },
    ReallocExiting { space: AddrSpace, base: u32 },
    MmInitEntering { space: AddrSpace },
    MmInitExiting { space: AddrSpace },

    /// Start of a blocking acquire wrapper (mutex_lock, sem_wait,
    /// rwlock_lock). A preemption point candidate.
    LockEntering { space: AddrSpace, addr: u32, kind: LockKind },
    /// The acquire succeeded; the lock is now held.
    LockExiting { space: AddrSpace, addr: u32, kind: LockKind },
    /// Start of a release wrapper. A preemption point candidate.
    UnlockEntering { space: AddrSpace, addr: u32, kind: LockKind },
    UnlockExiting { space: AddrSpace },
    /// cond_wait entry: atomically releases `mutex_addr` and blocks.
    CondWaitEntering { space: AddrSpace, addr: u32, mutex_addr: u32 },

    /// Initialization or teardown of a sync object at `addr` is in flux;
    /// accesses inside get flagged so the race reasoning can discount them.
    SyncInitEntering { addr: u32 },
    SyncInitExiting,
    SyncDestroyEntering { addr: u32 },
    SyncDestroyExiting,

    /// yield / deschedule / sleep wrapper entry: the thread reschedules of
    /// its own accord.
    VoluntaryResched { kind: ReschedKind },

    /// Kernel copying to or from user buffers on the user's behalf; those
    /// accesses belong to the user space under test.
    VmUserCopyEntering,
    VmUserCopyExiting,

    /// Outer user malloc-family wrapper (e.g. a thread-safe shim over the
    /// allocator): exempt from conflict tracking, still checked for
    /// use-after-free.
    UserMallocWrapperEntering,
    UserMallocWrapperExiting,

    /// The guest announced death: kernel or user panic, with the message
    /// recovered from guest memory.
    Panicked { space: AddrSpace },
    /// The test harness in the guest reported failure without panicking.
    ReportEndFail,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReschedKind {
    Yield,
    Deschedule,
    Sleep,
}

/// Everything the engine must know about the system under test. One
/// implementation per guest kernel, built from its symbol table; supplied
/// once at startup and never mutated.
pub trait GuestProfile {
    /// Interprets the instruction at `eip`, reporting at most one watched
    /// occurrence. Called once per instruction; implementations key off a
    /// table of watched eips.
    fn classify(&self, m: &mut dyn Machine, eip: u32) -> Option<GuestEvent>;

    /// Tid of the thread the guest scheduler currently considers running,
    /// computed from the current-TCB pointer.
    fn current_tid(&self, m: &mut dyn Machine) -> Tid;

    /// Panic message extraction, for `GuestEvent::Panicked` sites.
    fn panic_message(&self, m: &mut dyn Machine, eip: u32) -> Option<String> {
        let _ = (m, eip);
        None
    }

    /// Threads on the runqueue before the scheduler replica attaches.
    fn initial_runqueue(&self) -> Vec<Tid>;
    fn init_tid(&self) -> Tid;
    fn shell_tid(&self) -> Tid;
    fn idle_tid(&self) -> Option<Tid>;

    /// Address-space split, as predicates. Some guests put the kernel low,
    /// some high; the engine never assumes a constant.
    fn kernel_memory(&self, addr: u32) -> bool;
    fn user_memory(&self, addr: u32) -> bool;

    fn kern_address_in_heap(&self, addr: u32) -> bool;
    fn kern_address_global(&self, addr: u32) -> bool;
    fn user_address_in_heap(&self, addr: u32) -> bool;
    fn user_address_global(&self, addr: u32) -> bool;

    /// Scheduler-internal code and data get a free pass in the access
    /// tracker.
    fn in_scheduler(&self, eip: u32) -> bool;
    fn scheduler_access(&self, addr: u32) -> bool;

    /// Functions whose accesses never count as data races (e.g. the guest's
    /// own debug printing).
    fn ignore_dr_function(&self, eip: u32) -> bool;

    /// Is the workload under test a userspace program (true) or the kernel
    /// itself (false)?
    fn testing_userspace(&self) -> bool;

    /// Policy: tolerate malloc/free reentrancy per thread instead of
    /// treating it as a bug.
    fn allow_reentrant_malloc_free(&self) -> bool {
        false
    }

    /// Policy: on an unlock nobody holds, search other threads for the lock
    /// (some guests hand locks off between threads).
    fn allow_lock_handoff(&self) -> bool {
        false
    }

    /// Syscall vectors that let user threads communicate through kernel
    /// memory; their kernel accesses are charged to the user space under
    /// test.
    fn user_backchannel_syscalls(&self) -> &[u32] {
        &[]
    }

    /// The guest's yield syscall vector, for yield-loop accounting.
    fn syscall_is_yield(&self, number: u32) -> bool {
        let _ = number;
        false
    }
}

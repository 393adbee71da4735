//! A tiny deterministic guest for driving the engine end to end: a handful
//! of scripted threads, a round-robin "kernel" switched by injected timer
//! interrupts, and whole-state bookmarks so rewinds replay the exact same
//! event sequence.

use shakedown::lockset::LockKind;
use shakedown::machine::{BookmarkHandle, Event, Machine, Register};
use shakedown::messaging::{InputMessage, JobChannel, OutputMessage};
use shakedown::profile::{AddrSpace, GuestEvent, GuestProfile, ReschedKind};
use shakedown::vector_clock::Tid;
use shakedown::Engine;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

// kernel-side watched eips
pub const EIP_SCHED_INIT_DONE: u32 = 0x0000_1000;
pub const EIP_KERNEL_MAIN: u32 = 0x0000_1004;
pub const EIP_TIMER_ENTRY: u32 = 0x0000_1100;
pub const EIP_TIMER_EXIT: u32 = 0x0000_1104;
pub const EIP_CS_ENTRY: u32 = 0x0000_1200;
pub const EIP_CS_EXIT: u32 = 0x0000_1204;
pub const EIP_DESCHED: u32 = 0x0000_1300;
pub const EIP_MAKE_RUNNABLE: u32 = 0x0000_1304;

// userspace watched eips
pub const EIP_YIELD: u32 = 0x0100_0010;
pub const EIP_VANISH: u32 = 0x0100_0020;
pub const EIP_MUTEX_LOCK: u32 = 0x0100_0100;
pub const EIP_MUTEX_LOCK_DONE: u32 = 0x0100_0104;
pub const EIP_MUTEX_UNLOCK: u32 = 0x0100_0110;
pub const EIP_MUTEX_UNLOCK_DONE: u32 = 0x0100_0114;
pub const EIP_SEM_WAIT: u32 = 0x0100_0120;
pub const EIP_SEM_WAIT_DONE: u32 = 0x0100_0124;
pub const EIP_SEM_SIGNAL: u32 = 0x0100_0130;
pub const EIP_SEM_SIGNAL_DONE: u32 = 0x0100_0134;
pub const EIP_MALLOC_ENTER: u32 = 0x0100_0140;
pub const EIP_MALLOC_EXIT: u32 = 0x0100_0144;
pub const EIP_FREE_ENTER: u32 = 0x0100_0150;
pub const EIP_FREE_EXIT: u32 = 0x0100_0154;
pub const EIP_ASSERT_FAIL: u32 = 0x0100_0200;

pub const USER_HEAP_START: u32 = 0x0180_0000;
pub const USER_HEAP_END: u32 = 0x0190_0000;

const TID_CELL: u32 = 0xF000;
const OPERAND_CELL: u32 = 0xF004;
const IDLE_FLAG: u32 = 0x0100_F800;

pub const IDLE_TID: Tid = 0;

/// The eip of a thread's own straight-line op, unique per (tid, pc) so
/// data-race pairs are stable across branches.
pub fn op_eip(tid: Tid, pc: usize) -> u32 {
    0x0110_0000 + (tid << 16) + (pc as u32) * 8
}

#[derive(Clone, Debug)]
pub enum Op {
    Read(u32),
    Write(u32, u32),
    Inc(u32),
    Dec(u32),
    AssertEq(u32, u32),
    /// Read `addr` and yield until it holds `val`.
    SpinUntil(u32, u32),
    Yield,
    Lock(u32),
    Unlock(u32),
    SemWait(u32),
    SemSignal(u32),
    MallocAt(u32, u32),
    FreeAddr(u32),
    Exit,
}

#[derive(Clone, Debug)]
struct Emit {
    eip: u32,
    operand: u32,
    accesses: Vec<(u32, bool)>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Park {
    /// Never ran; starts straight at its program.
    Fresh,
    Running,
    /// Switched out inside the timer handler.
    InTimer,
    /// Switched out inside the plain context switcher.
    Plain,
}

#[derive(Clone, Debug)]
struct ThreadState {
    tid: Tid,
    pc: usize,
    phase: u8,
    runnable: bool,
    done: bool,
    park: Park,
    pending: VecDeque<Emit>,
}

#[derive(Clone, Debug, Default)]
struct MutexState {
    owner: Option<usize>,
    waiters: VecDeque<usize>,
}

#[derive(Clone, Debug, Default)]
struct SemState {
    count: u32,
    waiters: VecDeque<usize>,
}

#[derive(Clone, Debug)]
struct SwitchEmit {
    eip: u32,
    switch_to: Option<usize>,
}

#[derive(Clone, Debug)]
struct MState {
    threads: Vec<ThreadState>,
    current: usize,
    mem: BTreeMap<u32, u32>,
    mutexes: BTreeMap<u32, MutexState>,
    sems: BTreeMap<u32, SemState>,
    pending_timer: bool,
    switch_emits: VecDeque<SwitchEmit>,
    /// The switcher instruction was delivered; the new thread takes over
    /// from the next instruction on.
    pending_flip: Option<usize>,
    last_eip: u32,
    operand: u32,
    boot_stage: u8,
    halted: bool,
}

pub struct ScriptedMachine {
    programs: Vec<Vec<Op>>,
    state: MState,
    pre_instruction_state: MState,
    bookmarks: Vec<MState>,
    rewound: bool,
    pub exit_code: Option<i32>,
    pub timer_injections: u64,
    pub delays: u64,
}

impl ScriptedMachine {
    /// `threads` are the workload (tids must be nonzero); an idle thread
    /// (tid 0) that spins forever is appended so the runqueue is never
    /// empty.
    pub fn new(threads: Vec<(Tid, Vec<Op>)>, sems: &[(u32, u32)]) -> ScriptedMachine {
        let mut programs = Vec::new();
        let mut tstates = Vec::new();
        for (tid, program) in threads {
            assert!(tid != IDLE_TID);
            programs.push(program);
            tstates.push(ThreadState {
                tid,
                pc: 0,
                phase: 0,
                runnable: true,
                done: false,
                park: Park::Fresh,
                pending: VecDeque::new(),
            });
        }
        programs.push(vec![Op::SpinUntil(IDLE_FLAG, 1)]);
        tstates.push(ThreadState {
            tid: IDLE_TID,
            pc: 0,
            phase: 0,
            runnable: true,
            done: false,
            park: Park::Fresh,
            pending: VecDeque::new(),
        });

        let mut sem_map = BTreeMap::new();
        for &(addr, count) in sems {
            sem_map.insert(
                addr,
                SemState {
                    count,
                    waiters: VecDeque::new(),
                },
            );
        }

        let state = MState {
            threads: tstates,
            current: 0,
            mem: BTreeMap::new(),
            mutexes: BTreeMap::new(),
            sems: sem_map,
            pending_timer: false,
            switch_emits: VecDeque::new(),
            pending_flip: None,
            last_eip: 0,
            operand: 0,
            boot_stage: 0,
            halted: false,
        };
        ScriptedMachine {
            programs,
            pre_instruction_state: state.clone(),
            state,
            bookmarks: Vec::new(),
            rewound: false,
            exit_code: None,
            timer_injections: 0,
            delays: 0,
        }
    }

    pub fn tids(&self) -> Vec<Tid> {
        self.state.threads.iter().map(|t| t.tid).collect()
    }

    pub fn halted(&self) -> bool {
        self.state.halted
    }

    pub fn take_rewound(&mut self) -> bool {
        std::mem::replace(&mut self.rewound, false)
    }

    fn next_runnable(&self, exclude_current: bool) -> Option<usize> {
        let n = self.state.threads.len();
        let cur = self.state.current;
        for off in 1..=n {
            let i = (cur + off) % n;
            if i == cur && exclude_current {
                continue;
            }
            let t = &self.state.threads[i];
            if t.runnable && !t.done {
                return Some(i);
            }
        }
        None
    }

    fn begin_switch(&mut self, target: usize, via_timer: bool) {
        let old = self.state.current;
        if via_timer {
            self.state.switch_emits.push_back(SwitchEmit {
                eip: EIP_TIMER_ENTRY,
                switch_to: None,
            });
        }
        self.state.switch_emits.push_back(SwitchEmit {
            eip: EIP_CS_ENTRY,
            switch_to: Some(target),
        });
        match self.state.threads[target].park {
            Park::InTimer => {
                self.state.switch_emits.push_back(SwitchEmit {
                    eip: EIP_CS_EXIT,
                    switch_to: None,
                });
                self.state.switch_emits.push_back(SwitchEmit {
                    eip: EIP_TIMER_EXIT,
                    switch_to: None,
                });
            }
            Park::Plain => {
                self.state.switch_emits.push_back(SwitchEmit {
                    eip: EIP_CS_EXIT,
                    switch_to: None,
                });
            }
            Park::Fresh | Park::Running => {}
        }
        self.state.threads[old].park = if via_timer { Park::InTimer } else { Park::Plain };
        self.state.threads[target].park = Park::Running;
    }

    fn emit_events(&mut self, eip: u32, operand: u32, accesses: &[(u32, bool)]) -> Vec<Event> {
        self.state.last_eip = eip;
        self.state.operand = operand;
        let mut events = vec![Event::Instruction { eip }];
        for &(addr, write) in accesses {
            events.push(Event::MemAccess {
                phys_addr: addr,
                virt_addr: addr,
                write,
            });
        }
        events
    }

    /// Executes one instruction and returns its events. Empty when halted
    /// or deadlocked.
    pub fn step(&mut self) -> Vec<Event> {
        if self.state.halted {
            return Vec::new();
        }
        let pre = self.state.clone();

        let events = self.step_inner();
        if !events.is_empty() {
            self.pre_instruction_state = pre;
        }
        events
    }

    fn step_inner(&mut self) -> Vec<Event> {
        if self.state.boot_stage == 0 {
            self.state.boot_stage = 1;
            return self.emit_events(EIP_KERNEL_MAIN, 0, &[]);
        }
        if self.state.boot_stage == 1 {
            self.state.boot_stage = 2;
            return self.emit_events(EIP_SCHED_INIT_DONE, 0, &[]);
        }

        if let Some(next) = self.state.pending_flip.take() {
            self.state.current = next;
        }

        loop {
            if let Some(se) = self.state.switch_emits.pop_front() {
                if let Some(next) = se.switch_to {
                    self.state.pending_flip = Some(next);
                }
                return self.emit_events(se.eip, 0, &[]);
            }

            if self.state.pending_timer {
                self.state.pending_timer = false;
                if let Some(target) = self.next_runnable(true) {
                    if target != self.state.current {
                        self.begin_switch(target, true);
                        continue;
                    }
                }
                // nobody else to run; drop the interrupt
            }

            let cur = self.state.current;
            if let Some(e) = self.state.threads[cur].pending.pop_front() {
                let Emit {
                    eip,
                    operand,
                    accesses,
                } = e;
                return self.emit_events(eip, operand, &accesses);
            }

            if self.state.threads[cur].done || !self.state.threads[cur].runnable {
                match self.next_runnable(true) {
                    Some(target) => {
                        self.begin_switch(target, false);
                        continue;
                    }
                    None => {
                        self.state.halted = true;
                        return Vec::new();
                    }
                }
            }

            self.advance(cur);
        }
    }

    fn push(&mut self, i: usize, eip: u32, operand: u32, accesses: &[(u32, bool)]) {
        self.state.threads[i].pending.push_back(Emit {
            eip,
            operand,
            accesses: accesses.to_vec(),
        });
    }

    /// Lowers the current op of thread `i` into pending instructions,
    /// applying its state effects.
    fn advance(&mut self, i: usize) {
        let tid = self.state.threads[i].tid;
        let pc = self.state.threads[i].pc;
        let phase = self.state.threads[i].phase;
        let op = self
            .programs[i]
            .get(pc)
            .cloned()
            .unwrap_or(Op::Exit);
        let eip = op_eip(tid, pc);

        match op {
            Op::Read(a) => {
                self.push(i, eip, 0, &[(a, false)]);
                self.state.threads[i].pc += 1;
            }
            Op::Write(a, v) => {
                self.state.mem.insert(a, v);
                self.push(i, eip, 0, &[(a, true)]);
                self.state.threads[i].pc += 1;
            }
            Op::Inc(a) => {
                *self.state.mem.entry(a).or_insert(0) += 1;
                self.push(i, eip, 0, &[(a, false), (a, true)]);
                self.state.threads[i].pc += 1;
            }
            Op::Dec(a) => {
                let slot = self.state.mem.entry(a).or_insert(0);
                *slot = slot.saturating_sub(1);
                self.push(i, eip, 0, &[(a, false), (a, true)]);
                self.state.threads[i].pc += 1;
            }
            Op::AssertEq(a, v) => {
                let ok = self.state.mem.get(&a).copied().unwrap_or(0) == v;
                self.push(i, eip, 0, &[(a, false)]);
                if !ok {
                    self.push(i, EIP_ASSERT_FAIL, 0, &[]);
                }
                self.state.threads[i].pc += 1;
            }
            Op::SpinUntil(a, v) => {
                let ok = self.state.mem.get(&a).copied().unwrap_or(0) == v;
                self.push(i, eip, 0, &[(a, false)]);
                if ok {
                    self.state.threads[i].pc += 1;
                } else {
                    self.push(i, EIP_YIELD, 0, &[]);
                }
            }
            Op::Yield => {
                self.push(i, EIP_YIELD, 0, &[]);
                self.state.threads[i].pc += 1;
            }
            Op::Lock(a) => match phase {
                0 => {
                    self.push(i, EIP_MUTEX_LOCK, a, &[]);
                    self.state.threads[i].phase = 1;
                }
                1 => {
                    let mx = self.state.mutexes.entry(a).or_default();
                    if mx.owner.is_none() {
                        mx.owner = Some(i);
                        self.push(i, EIP_MUTEX_LOCK_DONE, a, &[]);
                        self.state.threads[i].phase = 0;
                        self.state.threads[i].pc += 1;
                    } else {
                        mx.waiters.push_back(i);
                        self.state.threads[i].runnable = false;
                        self.state.threads[i].phase = 2;
                        self.push(i, EIP_DESCHED, tid, &[]);
                    }
                }
                _ => {
                    // the unlocker handed us the mutex
                    self.push(i, EIP_MUTEX_LOCK_DONE, a, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::Unlock(a) => match phase {
                0 => {
                    self.push(i, EIP_MUTEX_UNLOCK, a, &[]);
                    self.state.threads[i].phase = 1;
                }
                _ => {
                    let woken = {
                        let mx = self.state.mutexes.entry(a).or_default();
                        mx.owner = None;
                        match mx.waiters.pop_front() {
                            Some(w) => {
                                mx.owner = Some(w);
                                Some(w)
                            }
                            None => None,
                        }
                    };
                    if let Some(w) = woken {
                        self.state.threads[w].runnable = true;
                        let wtid = self.state.threads[w].tid;
                        self.push(i, EIP_MAKE_RUNNABLE, wtid, &[]);
                    }
                    self.push(i, EIP_MUTEX_UNLOCK_DONE, a, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::SemWait(a) => match phase {
                0 => {
                    self.push(i, EIP_SEM_WAIT, a, &[]);
                    self.state.threads[i].phase = 1;
                }
                1 => {
                    let sem = self.state.sems.entry(a).or_default();
                    if sem.count > 0 {
                        sem.count -= 1;
                        self.push(i, EIP_SEM_WAIT_DONE, a, &[]);
                        self.state.threads[i].phase = 0;
                        self.state.threads[i].pc += 1;
                    } else {
                        sem.waiters.push_back(i);
                        self.state.threads[i].runnable = false;
                        self.state.threads[i].phase = 2;
                        self.push(i, EIP_DESCHED, tid, &[]);
                    }
                }
                _ => {
                    self.push(i, EIP_SEM_WAIT_DONE, a, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::SemSignal(a) => match phase {
                0 => {
                    self.push(i, EIP_SEM_SIGNAL, a, &[]);
                    self.state.threads[i].phase = 1;
                }
                _ => {
                    let woken = {
                        let sem = self.state.sems.entry(a).or_default();
                        match sem.waiters.pop_front() {
                            Some(w) => Some(w),
                            None => {
                                sem.count += 1;
                                None
                            }
                        }
                    };
                    if let Some(w) = woken {
                        self.state.threads[w].runnable = true;
                        let wtid = self.state.threads[w].tid;
                        self.push(i, EIP_MAKE_RUNNABLE, wtid, &[]);
                    }
                    self.push(i, EIP_SEM_SIGNAL_DONE, a, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::MallocAt(base, len) => match phase {
                0 => {
                    self.push(i, EIP_MALLOC_ENTER, len, &[]);
                    self.state.threads[i].phase = 1;
                }
                _ => {
                    self.push(i, EIP_MALLOC_EXIT, base, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::FreeAddr(base) => match phase {
                0 => {
                    self.push(i, EIP_FREE_ENTER, base, &[]);
                    self.state.threads[i].phase = 1;
                }
                _ => {
                    self.push(i, EIP_FREE_EXIT, base, &[]);
                    self.state.threads[i].phase = 0;
                    self.state.threads[i].pc += 1;
                }
            },
            Op::Exit => match phase {
                0 => {
                    self.push(i, EIP_VANISH, 0, &[]);
                    self.state.threads[i].phase = 1;
                }
                _ => {
                    self.push(i, EIP_DESCHED, tid, &[]);
                    self.state.threads[i].done = true;
                    self.state.threads[i].runnable = false;
                    self.state.threads[i].phase = 0;
                }
            },
        }
    }
}

impl Machine for ScriptedMachine {
    fn read_register(&mut self, reg: Register) -> u32 {
        match reg {
            Register::Eip => self.state.last_eip,
            Register::Eflags => 0x200,
            Register::Cr3 => 0x5000,
            _ => 0,
        }
    }

    fn write_register(&mut self, _reg: Register, _value: u32) {}

    fn read_phys_mem(&mut self, addr: u32, len: u32) -> Vec<u8> {
        let value = match addr {
            TID_CELL => self.state.threads[self.state.current].tid,
            OPERAND_CELL => self.state.operand,
            _ => self.state.mem.get(&addr).copied().unwrap_or(0),
        };
        value.to_le_bytes()[..len.min(4) as usize].to_vec()
    }

    fn write_phys_mem(&mut self, addr: u32, bytes: &[u8]) {
        let mut word = [0u8; 4];
        word[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
        self.state.mem.insert(addr, u32::from_le_bytes(word));
    }

    fn read_byte(&mut self, _virt_addr: u32) -> u8 {
        0
    }

    fn inject_timer_interrupt(&mut self) {
        self.timer_injections += 1;
        self.state.pending_timer = true;
    }

    fn inject_timer_interrupt_immediately(&mut self) -> u32 {
        self.inject_timer_interrupt();
        EIP_TIMER_ENTRY
    }

    fn inject_keypress(&mut self, _key: char) {}

    fn delay_instruction_by_one(&mut self) {
        self.delays += 1;
    }

    fn bookmark_here(&mut self) -> BookmarkHandle {
        self.bookmarks.push(self.pre_instruction_state.clone());
        BookmarkHandle(self.bookmarks.len() as u64 - 1)
    }

    fn rewind_to(&mut self, bookmark: BookmarkHandle) {
        self.state = self.bookmarks[bookmark.0 as usize].clone();
        self.rewound = true;
    }

    fn break_simulation(&mut self) {
        self.state.halted = true;
    }

    fn quit(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
        self.state.halted = true;
    }
}

/// Profile for the scripted guest: a direct table from the eips above to
/// guest events, with the operand cell supplying addresses and tids.
pub struct ToyProfile {
    pub runqueue: Vec<Tid>,
}

fn operand(m: &mut dyn Machine) -> u32 {
    let bytes = m.read_phys_mem(OPERAND_CELL, 4);
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl GuestProfile for ToyProfile {
    fn classify(&self, m: &mut dyn Machine, eip: u32) -> Option<GuestEvent> {
        use GuestEvent::*;
        let space = AddrSpace::User;
        Some(match eip {
            EIP_KERNEL_MAIN => KernelMainEntered,
            EIP_SCHED_INIT_DONE => SchedInitDone,
            EIP_TIMER_ENTRY => TimerEntering,
            EIP_TIMER_EXIT => TimerExiting,
            EIP_CS_ENTRY => ContextSwitchEntering,
            EIP_CS_EXIT => ContextSwitchExiting,
            EIP_DESCHED => ThreadDescheduling { tid: operand(m) },
            EIP_MAKE_RUNNABLE => ThreadRunnable { tid: operand(m) },
            EIP_YIELD => VoluntaryResched {
                kind: ReschedKind::Yield,
            },
            EIP_VANISH => VanishEntering,
            EIP_MUTEX_LOCK => LockEntering {
                space,
                addr: operand(m),
                kind: LockKind::Mutex,
            },
            EIP_MUTEX_LOCK_DONE => LockExiting {
                space,
                addr: operand(m),
                kind: LockKind::Mutex,
            },
            EIP_MUTEX_UNLOCK => UnlockEntering {
                space,
                addr: operand(m),
                kind: LockKind::Mutex,
            },
            EIP_MUTEX_UNLOCK_DONE => UnlockExiting { space },
            EIP_SEM_WAIT => LockEntering {
                space,
                addr: operand(m),
                kind: LockKind::Sem,
            },
            EIP_SEM_WAIT_DONE => LockExiting {
                space,
                addr: operand(m),
                kind: LockKind::Sem,
            },
            EIP_SEM_SIGNAL => UnlockEntering {
                space,
                addr: operand(m),
                kind: LockKind::Sem,
            },
            EIP_SEM_SIGNAL_DONE => UnlockExiting { space },
            EIP_MALLOC_ENTER => AllocEntering {
                space,
                page: false,
                size: operand(m),
            },
            EIP_MALLOC_EXIT => AllocExiting {
                space,
                page: false,
                base: operand(m),
            },
            EIP_FREE_ENTER => FreeEntering {
                space,
                page: false,
                base: operand(m),
            },
            EIP_FREE_EXIT => FreeExiting { space, page: false },
            EIP_ASSERT_FAIL => Panicked { space },
            _ => return None,
        })
    }

    fn current_tid(&self, m: &mut dyn Machine) -> Tid {
        let bytes = m.read_phys_mem(TID_CELL, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn panic_message(&self, _m: &mut dyn Machine, _eip: u32) -> Option<String> {
        Some("assertion failed in guest".to_string())
    }

    fn initial_runqueue(&self) -> Vec<Tid> {
        self.runqueue.clone()
    }

    fn init_tid(&self) -> Tid {
        IDLE_TID
    }

    fn shell_tid(&self) -> Tid {
        IDLE_TID
    }

    fn idle_tid(&self) -> Option<Tid> {
        None
    }

    fn kernel_memory(&self, addr: u32) -> bool {
        addr < 0x0100_0000
    }

    fn user_memory(&self, addr: u32) -> bool {
        !self.kernel_memory(addr)
    }

    fn kern_address_in_heap(&self, _addr: u32) -> bool {
        false
    }

    fn kern_address_global(&self, _addr: u32) -> bool {
        true
    }

    fn user_address_in_heap(&self, addr: u32) -> bool {
        (USER_HEAP_START..USER_HEAP_END).contains(&addr)
    }

    fn user_address_global(&self, addr: u32) -> bool {
        !self.user_address_in_heap(addr)
    }

    fn in_scheduler(&self, eip: u32) -> bool {
        eip < 0x0000_2000
    }

    fn scheduler_access(&self, _addr: u32) -> bool {
        false
    }

    fn ignore_dr_function(&self, _eip: u32) -> bool {
        false
    }

    fn testing_userspace(&self) -> bool {
        true
    }
}

/// Job channel that keeps everything sent, shared with the test body.
pub struct SharedChannel {
    pub messages: Rc<RefCell<Vec<OutputMessage>>>,
}

impl JobChannel for SharedChannel {
    fn send(&mut self, msg: OutputMessage) {
        self.messages.borrow_mut().push(msg);
    }

    fn recv(&mut self) -> InputMessage {
        InputMessage { do_abort: false }
    }
}

pub fn shared_channel() -> (SharedChannel, Rc<RefCell<Vec<OutputMessage>>>) {
    let messages = Rc::new(RefCell::new(Vec::new()));
    (
        SharedChannel {
            messages: Rc::clone(&messages),
        },
        messages,
    )
}

/// Drives the machine and engine to completion (or the step cap, which
/// fails the test).
pub fn run_exploration(machine: &mut ScriptedMachine, engine: &mut Engine, max_steps: u64) {
    engine.launch_test(machine);
    let mut steps = 0u64;
    while !engine.is_done() && !machine.halted() && steps < max_steps {
        let events = machine.step();
        if events.is_empty() {
            break;
        }
        for event in events {
            engine.on_event(machine, event);
            if machine.take_rewound() || engine.is_done() {
                break;
            }
        }
        steps += 1;
    }
    assert!(steps < max_steps, "exploration did not terminate");
}

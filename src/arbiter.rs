use crate::log::LogLevel;
use crate::pp::PpConfig;
use crate::profile::AddrSpace;
use crate::schedule::{Action, ThreadTable};
use crate::stack::StackTrace;
use crate::user_sync::TOO_MANY_XCHGS;
use crate::vector_clock::Tid;
use std::collections::VecDeque;

/// Why the current instruction is a preemption point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PpKind {
    /// The thread got here by rescheduling on its own (yield/sleep/
    /// deschedule) rather than a timer or sync primitive.
    pub voluntary: bool,
    /// Speculative: the suspected racing eip, if this PP exists to chase a
    /// data race.
    pub data_race_eip: Option<u32>,
}

/// What the engine observed at the current instruction, as far as PP
/// detection cares.
pub struct PpQuery<'a> {
    pub eip: u32,
    pub space: AddrSpace,
    /// At the start of a mutex/sem/rwlock/cvar wrapper.
    pub sync_wrapper_entry: bool,
    /// At a voluntary reschedule.
    pub voluntary_resched: bool,
    pub stack_trace: &'a StackTrace,
}

/// Chooses which thread runs at each preemption point, and decides which
/// instructions are preemption points at all.
#[derive(Clone, Debug, Default)]
pub struct Arbiter {
    /// Choices queued by the explorer after a rewind; consumed before any
    /// automatic decision.
    choices: VecDeque<Tid>,
}

impl Arbiter {
    pub fn new() -> Arbiter {
        Arbiter::default()
    }

    pub fn append_choice(&mut self, tid: Tid) {
        self.choices.push_back(tid);
    }

    pub fn pop_choice(&mut self) -> Option<Tid> {
        self.choices.pop_front()
    }

    pub fn clear_choices(&mut self) {
        self.choices.clear();
    }

    /// Is the current instruction a preemption point? Scheduler-internal
    /// code never is; the within-function directives filter sync-primitive
    /// and voluntary PPs; speculative-DR and forced eips bypass the filter.
    pub fn interested(
        &self,
        pps: &PpConfig,
        sched: &ThreadTable,
        q: &PpQuery,
    ) -> Option<PpKind> {
        let cur = sched.current();
        if cur
            .action
            .intersects(Action::HANDLING_TIMER | Action::CONTEXT_SWITCH)
        {
            return None;
        }
        if !sched.guest_init_done {
            return None;
        }

        if pps.forced(q.eip) {
            return Some(PpKind {
                voluntary: false,
                data_race_eip: None,
            });
        }

        if pps.suspected_data_race(q.eip, cur.tid, cur.last_call, cur.most_recent_syscall) {
            return Some(PpKind {
                voluntary: false,
                data_race_eip: Some(q.eip),
            });
        }

        if !(q.sync_wrapper_entry || q.voluntary_resched) {
            return None;
        }
        let allowed = match q.space {
            AddrSpace::Kern => pps.kern_within_functions(q.stack_trace),
            AddrSpace::User => pps.user_within_functions(q.stack_trace),
        };
        if !allowed {
            return None;
        }
        Some(PpKind {
            voluntary: q.voluntary_resched,
            data_race_eip: None,
        })
    }

    /// Picks the next thread to run. Returns the tid and whether the choice
    /// was ours (false when the explorer queued it). None means nobody is
    /// eligible: every live thread is blocked.
    ///
    /// The default schedule runs each thread until it blocks or exits:
    /// with no queued choice the current thread keeps going, so the first
    /// branch is one natural serial execution and every preemption in the
    /// tree is one DPOR deliberately asked for.
    pub fn choose(&mut self, sched: &ThreadTable) -> Option<(Tid, bool)> {
        if let Some(tid) = self.pop_choice() {
            log!(LogLevel::LogDebug, "looking for requested thread {}", tid);
            if sched.on_runqueue(tid) || sched.on_sleep_queue(tid) {
                return Some((tid, false));
            }
            log!(
                LogLevel::LogWarn,
                "failed to choose requested thread {}; it is not runnable",
                tid
            );
            return None;
        }

        let eligible = |tid: Tid| {
            let t = sched.thread(tid).unwrap();
            !t.user_yield.is_blocked() && t.xchg_count < TOO_MANY_XCHGS
        };

        let cur = sched.current_tid();
        if sched.on_runqueue(cur) && eligible(cur) {
            return Some((cur, true));
        }
        sched
            .runnable_tids()
            .into_iter()
            .find(|&tid| eligible(tid))
            .map(|tid| (tid, true))
    }
}

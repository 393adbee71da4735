use crate::stack::StackTrace;
use crate::vector_clock::Tid;

/// Whitelist/blacklist directive the arbiter uses to enable or disable the
/// sync-primitive and voluntary-reschedule preemption points inside (or
/// outside) one function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PpWithin {
    pub func_start: u32,
    pub func_end: u32,
    /// true: only preempt within this function; false: never within it.
    pub within: bool,
}

/// A speculative preemption point from a data race seen on an earlier run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PpDataRace {
    pub eip: u32,
    /// None matches any thread.
    pub tid: Option<Tid>,
    /// 0 matches any call site.
    pub last_call: u32,
    pub most_recent_syscall: u32,
}

/// Preemption-point configuration for one exploration job, handed down by
/// the outer driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpConfig {
    pub kern_withins: Vec<PpWithin>,
    pub user_withins: Vec<PpWithin>,
    pub data_races: Vec<PpDataRace>,
    /// Explicit instruction mask: always a PP, no filtering.
    pub forced_eips: Vec<u32>,
}

/// If there are no whitelist directives the default answer is yes; the
/// first whitelist directive flips the default to no. Later directives take
/// precedence, so all of them are consulted.
fn check_withins(pps: &[PpWithin], st: &StackTrace) -> bool {
    let mut any_whitelist = false;
    let mut answer = true;
    for pp in pps {
        let within = st.within_function(pp.func_start, pp.func_end);
        if pp.within {
            if !any_whitelist {
                any_whitelist = true;
                answer = false;
            }
            if within {
                answer = true;
            }
        } else if within {
            answer = false;
        }
    }
    answer
}

impl PpConfig {
    pub fn kern_within_functions(&self, st: &StackTrace) -> bool {
        check_withins(&self.kern_withins, st)
    }

    pub fn user_within_functions(&self, st: &StackTrace) -> bool {
        check_withins(&self.user_withins, st)
    }

    pub fn forced(&self, eip: u32) -> bool {
        self.forced_eips.contains(&eip)
    }

    /// Does the current instruction match a registered suspected data race?
    pub fn suspected_data_race(
        &self,
        eip: u32,
        tid: Tid,
        last_call: u32,
        most_recent_syscall: u32,
    ) -> bool {
        self.data_races.iter().any(|pp| {
            pp.eip == eip
                && (pp.tid.is_none() || pp.tid == Some(tid))
                && (pp.last_call == 0 || pp.last_call == last_call)
                && pp.most_recent_syscall == most_recent_syscall
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn st(frames: &[u32]) -> StackTrace {
        StackTrace {
            tid: 1,
            frames: frames.to_vec(),
        }
    }

    #[test]
    fn no_directives_allows_everything() {
        let p = PpConfig::default();
        assert!(p.kern_within_functions(&st(&[0x1234])));
    }

    #[test]
    fn whitelist_flips_default() {
        let p = PpConfig {
            user_withins: vec![PpWithin {
                func_start: 0x1000,
                func_end: 0x1fff,
                within: true,
            }],
            ..PpConfig::default()
        };
        assert!(p.user_within_functions(&st(&[0x1800])));
        assert!(!p.user_within_functions(&st(&[0x2800])));
    }

    #[test]
    fn later_blacklist_wins() {
        let p = PpConfig {
            user_withins: vec![
                PpWithin {
                    func_start: 0x1000,
                    func_end: 0x1fff,
                    within: true,
                },
                PpWithin {
                    func_start: 0x1800,
                    func_end: 0x18ff,
                    within: false,
                },
            ],
            ..PpConfig::default()
        };
        assert!(p.user_within_functions(&st(&[0x1700])));
        assert!(!p.user_within_functions(&st(&[0x1850])));
    }

    #[test]
    fn data_race_pp_matching() {
        let p = PpConfig {
            data_races: vec![PpDataRace {
                eip: 0x3000,
                tid: None,
                last_call: 0,
                most_recent_syscall: 0,
            }],
            ..PpConfig::default()
        };
        assert!(p.suspected_data_race(0x3000, 7, 0x9999, 0));
        assert!(!p.suspected_data_race(0x3004, 7, 0, 0));
        assert!(!p.suspected_data_race(0x3000, 7, 0, 4));
    }
}

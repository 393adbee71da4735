use crate::log::LogLevel;
use crate::machine::Machine;
use crate::profile::GuestProfile;
use crate::schedule::ThreadTable;

/// Lifecycle of the workload under test. The test is considered running
/// while any thread besides init, shell, and idle exists.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TestState {
    pub test_is_running: bool,
    pub test_ever_caused: bool,
    pub current_test: Option<String>,
    /// Live heap sizes when the test began; anything missing at clean exit
    /// leaked.
    pub start_kern_heap_size: u32,
    pub start_user_heap_size: u32,
}

fn anybody_alive(sched: &ThreadTable, profile: &dyn GuestProfile) -> bool {
    sched.alive_tids().iter().any(|&tid| {
        tid != profile.init_tid() && tid != profile.shell_tid() && Some(tid) != profile.idle_tid()
    })
}

impl TestState {
    pub fn new() -> TestState {
        TestState::default()
    }

    /// Returns true if the running/not-running state flipped.
    pub fn update(&mut self, sched: &ThreadTable, profile: &dyn GuestProfile) -> bool {
        if anybody_alive(sched, profile) {
            if !self.test_is_running {
                log!(LogLevel::LogInfo, "a test appears to be starting");
                self.test_is_running = true;
                return true;
            }
        } else if self.test_is_running {
            log!(LogLevel::LogInfo, "a test appears to be ending");
            self.current_test = None;
            self.test_is_running = false;
            return true;
        }
        false
    }

    /// Kicks the guest shell into running `test_name` by typing it.
    pub fn cause_test(&mut self, m: &mut dyn Machine, test_name: &str) -> bool {
        if self.test_is_running || self.current_test.is_some() {
            log!(
                LogLevel::LogWarn,
                "can't run {:?} with another test running",
                test_name
            );
            return false;
        }
        self.current_test = Some(test_name.to_string());
        self.test_ever_caused = true;
        for key in test_name.chars() {
            m.inject_keypress(key);
        }
        if !test_name.ends_with('\n') {
            m.inject_keypress('\n');
        }
        true
    }
}

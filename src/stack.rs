use crate::machine::{read_word, Machine, Register, WORD_SIZE};
use crate::vector_clock::Tid;
use std::fmt;

/// Deepest ebp chain we bother following. Student kernels rarely nest this
/// far; a clobbered ebp can point anywhere.
const MAX_FRAMES: usize = 64;

/// A guest stack trace: the faulting eip followed by return addresses from
/// the ebp chain. Symbolication happens outside the engine; the trace file
/// writer prints raw eips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackTrace {
    pub tid: Tid,
    pub frames: Vec<u32>,
}

impl StackTrace {
    /// Walks the ebp chain from the current machine state.
    pub fn capture(m: &mut dyn Machine, tid: Tid) -> StackTrace {
        let eip = m.read_register(Register::Eip);
        let mut frames = vec![eip];
        let mut ebp = m.read_register(Register::Ebp);

        while ebp != 0 && frames.len() < MAX_FRAMES {
            let ret_addr = read_word(m, ebp.wrapping_add(WORD_SIZE));
            if ret_addr == 0 {
                break;
            }
            frames.push(ret_addr);
            let next_ebp = read_word(m, ebp);
            // frames grow toward higher addresses; anything else is garbage
            if next_ebp <= ebp {
                break;
            }
            ebp = next_ebp;
        }

        StackTrace { tid, frames }
    }

    /// Does any frame of this trace lie within [func_start, func_end]?
    pub fn within_function(&self, func_start: u32, func_end: u32) -> bool {
        self.frames
            .iter()
            .any(|&eip| eip >= func_start && eip <= func_end)
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TID {}:", self.tid)?;
        for (i, eip) in self.frames.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, " {:#010x}", eip)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_function_checks_all_frames() {
        let st = StackTrace {
            tid: 3,
            frames: vec![0x1000, 0x2004, 0x3008],
        };
        assert!(st.within_function(0x2000, 0x2fff));
        assert!(st.within_function(0x1000, 0x1000));
        assert!(!st.within_function(0x4000, 0x5000));
    }
}

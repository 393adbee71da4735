use crate::log::LogLevel;
use crate::save::SaveState;
use crate::tree::NodeId;
use crate::vector_clock::Tid;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide trace numbering, so traces from every branch and every
/// engine land in distinct files.
static TRACE_SERIAL: AtomicU64 = AtomicU64::new(0);

const COLOUR_BOLD_RED: &str = "\x1b[1;31m";
const COLOUR_BOLD_GREEN: &str = "\x1b[1;32m";
const COLOUR_DEFAULT: &str = "\x1b[0m";

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize)]
pub enum BugKind {
    KernelPanic,
    UserspacePanic,
    /// The wrong space panicked for the kind of test being run; more
    /// likely a harness misconfiguration than a guest bug.
    WrongPanic,
    TripleFault,
    TestReportedFailure,
    DoubleFree,
    FreeOfUnallocated,
    InteriorPointerFree,
    InvalidHeapAccess,
    UseAfterFree,
    ReentrantAllocator,
    KernelMemoryLeak,
    UserMemoryLeak,
    Deadlock,
    NoProgress,
}

/// A guest bug, as a value. These flow to the trace writer and the job
/// channel; they are never errors of the engine itself.
#[derive(Clone, Debug, Serialize)]
pub struct BugReport {
    pub kind: BugKind,
    pub description: String,
    /// Supporting lines (stack traces, freed-chunk provenance, heap dumps).
    pub details: Vec<String>,
}

impl BugReport {
    pub fn new(kind: BugKind, description: String) -> BugReport {
        BugReport {
            kind,
            description,
            details: Vec::new(),
        }
    }

    pub fn with_details(kind: BugKind, description: String, details: Vec<String>) -> BugReport {
        BugReport {
            kind,
            description,
            details,
        }
    }
}

#[derive(Serialize)]
struct TraceChoice {
    n: usize,
    eip: u32,
    trigger_count: u64,
    tid: Option<Tid>,
}

#[derive(Serialize)]
struct TraceFile<'a> {
    bug: &'a BugReport,
    choices: Vec<TraceChoice>,
    current_eip: u32,
    trigger_count: u64,
    total_triggers: u64,
    total_choices: u64,
    total_jumps: u64,
}

/// The choice trace: one entry per preemption point from the root down,
/// each naming the tid chosen *at* that point.
fn collect_choices(save: &SaveState, current: Option<NodeId>, next_tid: Option<Tid>) -> Vec<TraceChoice> {
    let mut choices = Vec::new();
    let leaf = match current {
        Some(id) => id,
        None => return choices,
    };
    let path = save.tree.path_from_root(leaf);
    for (n, window) in path.windows(2).enumerate() {
        let node = save.tree.node(window[0]);
        choices.push(TraceChoice {
            n: n + 1,
            eip: node.eip,
            trigger_count: node.trigger_count,
            tid: save.tree.node(window[1]).chosen_thread,
        });
    }
    let last = save.tree.node(leaf);
    choices.push(TraceChoice {
        n: path.len(),
        eip: last.eip,
        trigger_count: last.trigger_count,
        tid: next_tid,
    });
    choices
}

/// Writes the bug trace: an ANSI text file plus a machine-readable json
/// sidecar, named uniquely per process and per bug. Returns the text
/// file's path for the FoundABug message.
pub fn write_trace_file(
    dir: &Path,
    report: &BugReport,
    save: &SaveState,
    next_tid: Option<Tid>,
    current_eip: u32,
    trigger_count: u64,
    absolute_trigger_count: u64,
) -> io::Result<PathBuf> {
    let pid = unsafe { libc::getpid() };
    let serial = TRACE_SERIAL.fetch_add(1, Ordering::SeqCst);
    let path = dir.join(format!("shakedown.trace.{}.{}", pid, serial));
    let mut f = File::create(&path)?;

    writeln!(f, "{}****    A bug was found!   ****{}", COLOUR_BOLD_RED, COLOUR_DEFAULT)?;
    writeln!(f, "{}{:?}: {}{}", COLOUR_BOLD_RED, report.kind, report.description, COLOUR_DEFAULT)?;
    for line in &report.details {
        writeln!(f, "{}", line)?;
    }
    writeln!(f, "{}**** Choice trace follows. ****{}", COLOUR_BOLD_GREEN, COLOUR_DEFAULT)?;

    let choices = collect_choices(save, save.current, next_tid);
    for c in &choices {
        match c.tid {
            Some(tid) => writeln!(
                f,
                "Choice {}: at eip {:#010x}, trigger_count {}, TID {}",
                c.n, c.eip, c.trigger_count, tid
            )?,
            None => writeln!(
                f,
                "Choice {}: at eip {:#010x}, trigger_count {}, TID ?",
                c.n, c.eip, c.trigger_count
            )?,
        }
    }
    if let Some(leaf) = save.current {
        if let Some(st) = &save.tree.node(leaf).stack_trace {
            writeln!(f, "Stack at last choice: {}", st)?;
        }
    }
    writeln!(
        f,
        "Current eip {:#010x}, trigger_count {}, total triggers {}",
        current_eip, trigger_count, absolute_trigger_count
    )?;
    writeln!(
        f,
        "Total choices {}, total backtracks {}",
        save.total_choices, save.total_jumps
    )?;

    let sidecar = TraceFile {
        bug: report,
        choices,
        current_eip,
        trigger_count,
        total_triggers: absolute_trigger_count,
        total_choices: save.total_choices,
        total_jumps: save.total_jumps,
    };
    let json_path = PathBuf::from(format!("{}.json", path.display()));
    serde_json::to_writer_pretty(File::create(json_path)?, &sidecar)?;

    log!(
        LogLevel::LogError,
        "A bug was found! {:?}: {} (trace: {})",
        report.kind,
        report.description,
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::BookmarkHandle;
    use crate::tree::tests::snapshot_fixture;

    #[test]
    fn trace_has_one_choice_line_per_pp() {
        let mut save = SaveState::new();
        let snap = snapshot_fixture(&[1, 2]);
        let root = save.tree.insert(
            None,
            0x1000,
            0,
            None,
            None,
            snap.clone(),
            BookmarkHandle(0),
            true,
            None,
            false,
        );
        let a = save.tree.insert(
            Some(root),
            0x2000,
            10,
            Some(1),
            None,
            snap.clone(),
            BookmarkHandle(1),
            true,
            None,
            false,
        );
        save.current = Some(a);

        let choices = collect_choices(&save, Some(a), Some(2));
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0].n, 1);
        assert_eq!(choices[0].eip, 0x1000);
        // the tid printed at a choice is the one taken there
        assert_eq!(choices[0].tid, Some(1));
        assert_eq!(choices[1].eip, 0x2000);
        assert_eq!(choices[1].tid, Some(2));
    }

    #[test]
    fn trace_file_written_with_ansi() {
        let dir = std::env::temp_dir();
        let mut save = SaveState::new();
        let snap = snapshot_fixture(&[1]);
        let root = save.tree.insert(
            None,
            0x1000,
            0,
            None,
            None,
            snap,
            BookmarkHandle(0),
            true,
            None,
            false,
        );
        save.current = Some(root);
        let report = BugReport::new(BugKind::UseAfterFree, "read from freed".to_string());
        let path =
            write_trace_file(&dir, &report, &save, Some(1), 0x1004, 7, 7).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\x1b[1;31m"));
        assert!(text.contains("Choice 1: at eip 0x00001000, trigger_count 0, TID 1"));
        std::fs::remove_file(&path).unwrap();
        std::fs::remove_file(format!("{}.json", path.display())).unwrap();
    }
}

use crate::vector_clock::Tid;
use serde::{Deserialize, Serialize};

/// Messages the engine sends to the outer iterative-deepening driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum OutputMessage {
    /// Startup ack, sent exactly once before anything else.
    ThunderbirdsAreGo,
    DataRace {
        eip: u32,
        tid: Tid,
        last_call: u32,
        most_recent_syscall: u32,
        confirmed: bool,
        /// Found without any artificial preemption, i.e. a single-pass
        /// detector would have found it too.
        deterministic: bool,
    },
    Estimate {
        proportion: f64,
        branches: u64,
        total_usecs: f64,
        elapsed_usecs: u64,
    },
    FoundABug {
        trace_filename: String,
    },
    ShouldContinue,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub do_abort: bool,
}

/// Channel to the outer driver. The only blocking calls the engine ever
/// makes go through here.
pub trait JobChannel {
    fn send(&mut self, msg: OutputMessage);
    /// Blocking; only ever called right after a `ShouldContinue` send.
    fn recv(&mut self) -> InputMessage;
}

/// Probes the driver for an abort request.
pub fn should_abort(channel: &mut dyn JobChannel) -> bool {
    channel.send(OutputMessage::ShouldContinue);
    channel.recv().do_abort
}

/// Stand-in for running outside the wrapper: discards output, never aborts.
#[derive(Default)]
pub struct NullJobChannel;

impl JobChannel for NullJobChannel {
    fn send(&mut self, _msg: OutputMessage) {}

    fn recv(&mut self) -> InputMessage {
        InputMessage { do_abort: false }
    }
}

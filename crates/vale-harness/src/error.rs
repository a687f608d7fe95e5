use thiserror::Error;

use crate::cleanup::TrapSignal;
use crate::status::ExitExpectation;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signal handling unavailable: {0}")]
    SignalSetup(std::io::Error),
    #[error("invalid bridge name {0:?}: VALE bridges are named vale*")]
    InvalidBridge(String),
    #[error("status channel write failed: {0}")]
    StatusWrite(std::io::Error),
    #[error("`{argv}` exited with {code}")]
    CommandFailed { argv: String, code: i32 },
}

/// Fatal outcome of a test run.
///
/// Guarded calls never hand a mismatch back as something to recover from:
/// callers propagate it with `?` to [`Harness::finish`](crate::Harness::finish),
/// which drains the cleanup stack and turns it into the process exit status.
#[derive(Debug, Error)]
pub enum Abort {
    #[error("{}", .0.describe())]
    Mismatch(ExitExpectation),
    #[error("test failed: {0}")]
    Failed(String),
    #[error("interrupted by SIG{0}")]
    Interrupted(TrapSignal),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

impl Abort {
    /// Process exit status for this outcome: the signal status for an
    /// interruption, `1` for everything else.
    pub fn exit_status(&self) -> i32 {
        match self {
            Abort::Interrupted(signal) => signal.exit_status(),
            _ => 1,
        }
    }
}

//! LIFO cleanup stack bound to termination signals.
//!
//! Actions are kept per signal in acquisition order and popped from the back
//! when the signal fires, so a partially built resource graph is unwound in
//! exactly the reverse order it was put together. Each action runs at most
//! once; a failing or panicking action never stops the ones behind it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::runner::CommandRunner;

/// Termination event a cleanup action can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapSignal {
    /// Process exit, normal or not.
    Exit,
    Interrupt,
    Terminate,
    Hangup,
}

impl TrapSignal {
    pub const ALL: [TrapSignal; 4] = [
        TrapSignal::Exit,
        TrapSignal::Interrupt,
        TrapSignal::Terminate,
        TrapSignal::Hangup,
    ];

    /// OS signal number, `None` for [`TrapSignal::Exit`].
    pub fn signo(self) -> Option<libc::c_int> {
        match self {
            TrapSignal::Exit => None,
            TrapSignal::Interrupt => Some(libc::SIGINT),
            TrapSignal::Terminate => Some(libc::SIGTERM),
            TrapSignal::Hangup => Some(libc::SIGHUP),
        }
    }

    pub fn from_signo(signo: libc::c_int) -> Option<Self> {
        TrapSignal::ALL
            .into_iter()
            .find(|signal| signal.signo() == Some(signo))
    }

    /// Exit status of a process terminated through this signal (`128 + signo`).
    pub fn exit_status(self) -> i32 {
        self.signo().map_or(0, |signo| 128 + signo)
    }

    fn index(self) -> usize {
        match self {
            TrapSignal::Exit => 0,
            TrapSignal::Interrupt => 1,
            TrapSignal::Terminate => 2,
            TrapSignal::Hangup => 3,
        }
    }
}

impl fmt::Display for TrapSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrapSignal::Exit => "EXIT",
            TrapSignal::Interrupt => "INT",
            TrapSignal::Terminate => "TERM",
            TrapSignal::Hangup => "HUP",
        })
    }
}

type CleanupFn = Box<dyn FnOnce(&mut dyn CommandRunner) -> Result<(), HarnessError> + Send>;

/// A single teardown step.
///
/// The closure gets the command runner when it executes and should capture
/// only owned data (names, argv), never harness state.
pub struct CleanupAction {
    label: String,
    run: CleanupFn,
}

impl CleanupAction {
    pub fn new<F>(label: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(&mut dyn CommandRunner) -> Result<(), HarnessError> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(run),
        }
    }

    /// Runs each command in order. All of them are attempted; the first
    /// non-zero exit is reported.
    pub fn commands(label: impl Into<String>, commands: Vec<Vec<String>>) -> Self {
        Self::new(label, move |runner| {
            let mut first_failure = None;
            for argv in &commands {
                let code = runner.run(argv);
                if code != 0 && first_failure.is_none() {
                    first_failure = Some(HarnessError::CommandFailed {
                        argv: argv.join(" "),
                        code,
                    });
                }
            }
            first_failure.map_or(Ok(()), Err)
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a test run as seen by its cleanup stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Acquiring,
    Running,
    Terminating,
    Drained,
}

/// Outcome of draining one or more signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub ran: usize,
    pub failed: usize,
}

impl TriggerReport {
    fn merge(self, other: TriggerReport) -> TriggerReport {
        TriggerReport {
            ran: self.ran + other.ran,
            failed: self.failed + other.failed,
        }
    }
}

#[derive(Debug)]
pub struct CleanupStack {
    actions: [Vec<CleanupAction>; 4],
    drained: [bool; 4],
    phase: Phase,
}

impl Default for CleanupStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        Self {
            actions: Default::default(),
            drained: [false; 4],
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of actions still waiting on `signal`.
    pub fn pending(&self, signal: TrapSignal) -> usize {
        self.actions[signal.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(Vec::is_empty)
    }

    /// Binds `action` to `signal`, ahead of everything registered before it.
    ///
    /// Once termination has begun the action is dropped and `false` is
    /// returned: nothing acquired after that point may be torn down by a
    /// stack that has already been unwound.
    pub fn register(&mut self, signal: TrapSignal, action: CleanupAction) -> bool {
        if matches!(self.phase, Phase::Terminating | Phase::Drained) || self.drained[signal.index()]
        {
            warn!(
                signal = %signal,
                label = action.label(),
                "cleanup stack already unwinding, dropping registration"
            );
            return false;
        }
        if self.phase == Phase::Init {
            self.phase = Phase::Acquiring;
        }
        debug!(signal = %signal, label = action.label(), "cleanup registered");
        self.actions[signal.index()].push(action);
        true
    }

    /// Marks the end of resource setup. Registration stays allowed.
    pub fn mark_running(&mut self) {
        if matches!(self.phase, Phase::Init | Phase::Acquiring) {
            self.phase = Phase::Running;
        }
    }

    /// Runs every action bound to `signal`, most recent first.
    ///
    /// A signal is drained once; triggering it again runs nothing.
    pub fn trigger(&mut self, signal: TrapSignal, runner: &mut dyn CommandRunner) -> TriggerReport {
        let idx = signal.index();
        let mut report = TriggerReport::default();
        if self.drained[idx] {
            debug!(signal = %signal, "already drained");
            return report;
        }
        if self.phase != Phase::Drained {
            self.phase = Phase::Terminating;
        }

        while let Some(action) = self.actions[idx].pop() {
            let CleanupAction { label, run } = action;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(&mut *runner)));
            report.ran += 1;
            match outcome {
                Ok(Ok(())) => debug!(signal = %signal, label = %label, "cleanup done"),
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(signal = %signal, label = %label, error = %e, "cleanup failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(signal = %signal, label = %label, "cleanup panicked");
                }
            }
        }
        self.drained[idx] = true;

        if signal == TrapSignal::Exit {
            self.phase = Phase::Drained;
        }
        report
    }

    /// Full teardown for a run ending through `signal`: its own actions
    /// first, then the exit actions.
    pub fn terminate(&mut self, signal: TrapSignal, runner: &mut dyn CommandRunner) -> TriggerReport {
        let mut report = self.trigger(signal, runner);
        if signal != TrapSignal::Exit {
            report = report.merge(self.trigger(TrapSignal::Exit, runner));
        }
        self.phase = Phase::Drained;
        report
    }
}

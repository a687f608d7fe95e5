//! The guarded-call chokepoint and its cleanup stack.
//!
//! All mutable harness state sits behind one mutex that every guarded call
//! and registration holds for its whole duration. A termination signal is
//! handled on the watcher thread and has to take the same lock, so it only
//! ever sees the stack between two statements of the test body. To get that
//! lock without waiting out a long running tool, the watcher first passes the
//! signal on to the command in flight.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::cleanup::{CleanupAction, CleanupStack, Phase, TrapSignal};
use crate::error::{Abort, HarnessError};
use crate::fd_server::FdServer;
use crate::link::IpLink;
use crate::runner::{CommandRunner, Foreground};
use crate::signals;
use crate::status::{ExitExpectation, StatusChannel};
use crate::vale::ValeCtl;

struct Shared {
    stack: CleanupStack,
    runner: Box<dyn CommandRunner + Send>,
    status: StatusChannel,
}

impl Shared {
    fn check(&mut self, expectation: ExitExpectation) -> Result<(), Abort> {
        if expectation.is_met() {
            return Ok(());
        }
        error!(
            label = %expectation.label,
            observed = expectation.observed,
            expected = expectation.expected,
            "guarded call mismatch"
        );
        if let Err(e) = self.status.mismatch(&expectation) {
            warn!(error = %e, "could not report mismatch");
        }
        Err(Abort::Mismatch(expectation))
    }

    fn terminate(&mut self, signal: TrapSignal) {
        let Shared { stack, runner, .. } = self;
        let report = stack.terminate(signal, runner.as_mut());
        info!(
            signal = %signal,
            ran = report.ran,
            failed = report.failed,
            "cleanup stack drained"
        );
    }
}

pub struct Harness {
    shared: Arc<Mutex<Shared>>,
    /// Signal number of a pending termination, `0` if none.
    interrupted: Arc<AtomicI32>,
    foreground: Option<Foreground>,
    pub(crate) vale: ValeCtl,
    pub(crate) ip: IpLink,
    pub(crate) fd_server: FdServer,
}

impl Harness {
    pub fn new(runner: impl CommandRunner + Send + 'static, status: StatusChannel) -> Self {
        let foreground = runner.foreground();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                stack: CleanupStack::new(),
                runner: Box::new(runner),
                status,
            })),
            interrupted: Arc::new(AtomicI32::new(0)),
            foreground,
            vale: ValeCtl::default(),
            ip: IpLink::default(),
            fd_server: FdServer::default(),
        }
    }

    pub fn with_tools(mut self, vale: ValeCtl, ip: IpLink, fd_server: FdServer) -> Self {
        self.vale = vale;
        self.ip = ip;
        self.fd_server = fd_server;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    pub fn phase(&self) -> Phase {
        self.lock().stack.phase()
    }

    pub fn pending(&self, signal: TrapSignal) -> usize {
        self.lock().stack.pending(signal)
    }

    /// See [`CleanupStack::register`].
    pub fn register(&self, signal: TrapSignal, action: CleanupAction) -> bool {
        self.lock().stack.register(signal, action)
    }

    pub fn mark_running(&self) {
        self.lock().stack.mark_running();
    }

    fn pending_interruption(&self) -> Option<TrapSignal> {
        match self.interrupted.load(Ordering::SeqCst) {
            0 => None,
            signo => TrapSignal::from_signo(signo),
        }
    }

    /// Runs `op` with the command runner and checks the code it returns.
    ///
    /// On a mismatch one failure line goes to the status channel and the run
    /// is aborted; on a match nothing is written.
    pub fn guard<F>(&self, expected: i32, label: &str, op: F) -> Result<(), Abort>
    where
        F: FnOnce(&mut dyn CommandRunner) -> i32,
    {
        self.acquire(expected, label, |runner| (op(runner), None))
    }

    pub fn run_guarded(&self, argv: &[String], expected: i32, label: &str) -> Result<(), Abort> {
        self.guard(expected, label, |runner| runner.run(argv))
    }

    /// Checks a code obtained outside the harness.
    pub fn check_exit(&self, observed: i32, expected: i32, label: &str) -> Result<(), Abort> {
        self.guard(expected, label, |_| observed)
    }

    /// Guarded call whose `op` may hand back the teardown of what it
    /// acquired.
    ///
    /// The teardown goes on the exit stack whenever `op` exited with `0`,
    /// whatever was expected: a create that was meant to fail but did not
    /// still left something behind. Registration happens under the same lock
    /// as `op`, so a signal cannot slip in between the two.
    pub(crate) fn acquire<F>(&self, expected: i32, label: &str, op: F) -> Result<(), Abort>
    where
        F: FnOnce(&mut dyn CommandRunner) -> (i32, Option<CleanupAction>),
    {
        if let Some(signal) = self.pending_interruption() {
            return Err(Abort::Interrupted(signal));
        }
        let mut shared = self.lock();
        let (observed, cleanup) = op(shared.runner.as_mut());
        if observed == 0 {
            if let Some(action) = cleanup {
                shared.stack.register(TrapSignal::Exit, action);
            }
        }
        // A command killed by a forwarded signal is not a mismatch.
        if let Some(signal) = self.pending_interruption() {
            info!(label, observed, "guarded call cut short by a signal");
            return Err(Abort::Interrupted(signal));
        }
        shared.check(ExitExpectation::new(observed, expected, label))
    }

    /// Writes the success line for `label` (or the harness tag).
    pub fn success(&self, label: &str) -> Result<(), HarnessError> {
        self.lock().status.success(label)
    }

    /// Reports an explicit test failure and returns the abort to propagate.
    pub fn fail(&self, reason: &str) -> Abort {
        if let Err(e) = self.lock().status.failed(reason) {
            warn!(error = %e, "could not report failure");
        }
        Abort::Failed(reason.to_string())
    }

    /// Ends the run: drains the cleanup stack and returns the exit status.
    ///
    /// A harness error has not been reported yet, so it gets its failure
    /// line here.
    pub fn finish(self, outcome: Result<(), Abort>) -> i32 {
        if let Some(foreground) = &self.foreground {
            foreground.close();
        }
        let mut shared = self.lock();
        let (signal, status) = match &outcome {
            Ok(()) => (TrapSignal::Exit, 0),
            Err(abort) => {
                error!(error = %abort, "test aborted");
                if let Abort::Harness(e) = abort {
                    if let Err(write_err) = shared.status.failed(&e.to_string()) {
                        warn!(error = %write_err, "could not report failure");
                    }
                }
                let signal = match abort {
                    Abort::Interrupted(signal) => *signal,
                    _ => TrapSignal::Exit,
                };
                (signal, abort.exit_status())
            }
        };
        shared.terminate(signal);
        status
    }

    /// Starts the signal watcher. On SIGINT, SIGTERM or SIGHUP the signal is
    /// passed on to the command in flight, the cleanup stack is drained and
    /// the process exits with `128 + signo`.
    ///
    /// Call before spawning any other thread: the termination signals are
    /// blocked in the calling thread and only threads created afterwards
    /// inherit that mask.
    pub fn install_signal_handlers(&self) -> Result<(), HarnessError> {
        let shared = Arc::clone(&self.shared);
        let interrupted = Arc::clone(&self.interrupted);
        let foreground = self.foreground.clone();
        let installed = signals::watch(move |signal| {
            let signo = signal.signo().unwrap_or(0);
            interrupted.store(signo, Ordering::SeqCst);
            warn!(signal = %signal, "termination signal received");
            if let Some(foreground) = &foreground {
                if foreground.forward(signo) {
                    info!(signal = %signal, "signal passed on to running command");
                }
            }
            let mut shared = lock_shared(&shared);
            if let Some(foreground) = &foreground {
                foreground.close();
            }
            shared.terminate(signal);
            std::process::exit(signal.exit_status());
        })
        .map_err(HarnessError::SignalSetup)?;
        if !installed {
            warn!("signal watcher already running");
        }
        Ok(())
    }
}

// A panic while holding the lock must not keep the cleanup stack from
// being drained.
fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ScriptedRunner, SharedBuffer};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn harness(runner: ScriptedRunner) -> (Harness, SharedBuffer) {
        let buf = SharedBuffer::new();
        (Harness::new(runner, StatusChannel::new(buf.clone())), buf)
    }

    #[test]
    fn matching_code_is_silent() {
        let (h, buf) = harness(ScriptedRunner::with_codes([0]));
        h.run_guarded(&argv(&["vale-ctl", "-n", "X"]), 0, "create X")
            .unwrap();
        assert_eq!(buf.contents(), "");
        assert_eq!(h.finish(Ok(())), 0);
    }

    #[test]
    fn mismatch_reports_once_and_exits_1() {
        let (h, buf) = harness(ScriptedRunner::with_codes([1]));
        let outcome = h.run_guarded(&argv(&["vale-ctl", "-n", "X"]), 0, "create X");
        assert!(matches!(outcome, Err(Abort::Mismatch(ref e)) if e.observed == 1));
        assert_eq!(buf.lines(), vec!["create X: create X FAIL(1 != 0)."]);
        assert_eq!(h.finish(outcome), 1);
        assert_eq!(buf.lines().len(), 1);
    }

    #[test]
    fn expected_failure_code_passes() {
        let (h, buf) = harness(ScriptedRunner::with_codes([1]));
        h.run_guarded(&argv(&["vale-ctl", "-r", "ghost"]), 1, "destroy missing port")
            .unwrap();
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn check_exit_uses_given_code() {
        let (h, buf) = harness(ScriptedRunner::new());
        h.check_exit(0, 0, "pkt-gen tx").unwrap();
        assert!(h.check_exit(2, 0, "pkt-gen rx").is_err());
        assert_eq!(buf.lines(), vec!["pkt-gen rx: pkt-gen rx FAIL(2 != 0)."]);
    }

    #[test]
    fn finish_drains_exit_actions_after_failure() {
        let runner = ScriptedRunner::new().fail_on("-a", 1);
        let calls = runner.call_log();
        let (h, _buf) = harness(runner);

        let outcome = (|| -> Result<(), Abort> {
            h.acquire(0, "create v0", |r| {
                let code = r.run(&argv(&["vale-ctl", "-n", "v0"]));
                let undo = CleanupAction::commands("destroy v0", vec![argv(&["vale-ctl", "-r", "v0"])]);
                (code, Some(undo))
            })?;
            h.run_guarded(&argv(&["vale-ctl", "-a", "vale0:v0"]), 0, "attach v0")?;
            Ok(())
        })();

        assert_eq!(h.finish(outcome), 1);
        assert_eq!(
            calls.commands(),
            vec!["vale-ctl -n v0", "vale-ctl -a vale0:v0", "vale-ctl -r v0"]
        );
    }

    #[test]
    fn failed_acquisition_registers_nothing() {
        let (h, _buf) = harness(ScriptedRunner::with_codes([1]));
        let outcome = h.acquire(0, "create v0", |r| {
            let code = r.run(&argv(&["vale-ctl", "-n", "v0"]));
            (code, Some(CleanupAction::new("destroy v0", |_| Ok(()))))
        });
        assert!(outcome.is_err());
        assert_eq!(h.pending(TrapSignal::Exit), 0);
    }

    #[test]
    fn unexpected_success_still_registers_teardown() {
        let (h, buf) = harness(ScriptedRunner::with_codes([0]));
        let outcome = h.acquire(1, "create v0 again", |r| {
            let code = r.run(&argv(&["vale-ctl", "-n", "v0"]));
            (code, Some(CleanupAction::new("destroy v0", |_| Ok(()))))
        });
        assert!(matches!(outcome, Err(Abort::Mismatch(ref e)) if e.observed == 0));
        assert_eq!(h.pending(TrapSignal::Exit), 1);
        assert_eq!(buf.lines(), vec!["create v0 again: create v0 again FAIL(0 != 1)."]);
    }

    #[test]
    fn signal_during_command_is_not_a_mismatch() {
        let (h, buf) = harness(ScriptedRunner::new());
        let interrupted = Arc::clone(&h.interrupted);
        let outcome = h.acquire(0, "create v0", |r| {
            let code = r.run(&argv(&["vale-ctl", "-n", "v0"]));
            // The watcher flags the signal while the command is running and
            // the command dies from it.
            interrupted.store(libc::SIGTERM, Ordering::SeqCst);
            (code + 143, Some(CleanupAction::new("destroy v0", |_| Ok(()))))
        });
        assert!(matches!(outcome, Err(Abort::Interrupted(TrapSignal::Terminate))));
        assert!(buf.contents().is_empty());
        assert_eq!(h.pending(TrapSignal::Exit), 0);
        assert_eq!(h.finish(outcome), 143);
    }

    #[test]
    fn harness_error_gets_a_failure_line() {
        let buf = SharedBuffer::new();
        let h = Harness::new(
            ScriptedRunner::new(),
            StatusChannel::new(buf.clone()).with_tag("bdg"),
        );
        let outcome = h.attach("br0", "v0", 0);
        assert_eq!(h.finish(outcome), 1);
        assert_eq!(
            buf.lines(),
            vec![r#"bdg: invalid bridge name "br0": VALE bridges are named vale* FAIL."#]
        );
    }

    #[test]
    fn explicit_failure_line() {
        let (h, buf) = harness(ScriptedRunner::new());
        let abort = h.fail("no packets received");
        assert_eq!(abort.exit_status(), 1);
        assert_eq!(
            buf.lines(),
            vec!["no packets received: no packets received FAIL."]
        );
    }

    #[test]
    fn pending_interruption_blocks_new_calls() {
        let runner = ScriptedRunner::new();
        let calls = runner.call_log();
        let (h, _buf) = harness(runner);
        h.interrupted.store(libc::SIGINT, Ordering::SeqCst);

        let outcome = h.run_guarded(&argv(&["vale-ctl", "-n", "v1"]), 0, "create v1");
        assert!(matches!(outcome, Err(Abort::Interrupted(TrapSignal::Interrupt))));
        assert!(calls.is_empty());
        assert_eq!(h.finish(outcome), 130);
    }

    #[test]
    fn interrupted_finish_runs_signal_then_exit_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (h, _buf) = harness(ScriptedRunner::new());
        for (signal, name) in [(TrapSignal::Exit, "exit"), (TrapSignal::Interrupt, "int")] {
            let log = Arc::clone(&log);
            h.register(
                signal,
                CleanupAction::new(name, move |_| {
                    log.lock().unwrap().push(name);
                    Ok(())
                }),
            );
        }
        h.finish(Err(Abort::Interrupted(TrapSignal::Interrupt)));
        assert_eq!(*log.lock().unwrap(), vec!["int", "exit"]);
    }

    #[test]
    fn success_line_uses_tag() {
        let buf = SharedBuffer::new();
        let h = Harness::new(
            ScriptedRunner::new(),
            StatusChannel::new(buf.clone()).with_tag("bdg-attach"),
        );
        h.success("unused").unwrap();
        assert_eq!(buf.contents(), "bdg-attach: success.\n");
    }
}

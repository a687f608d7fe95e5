//! External command execution.
//!
//! Guarded calls and cleanup actions only see a [`CommandRunner`], so the
//! exit-code logic can be driven by fakes as well as by the real bridge and
//! link tools.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

/// Runs an external command and reports its exit code.
pub trait CommandRunner {
    /// Runs `argv` to completion.
    fn run(&mut self, argv: &[String]) -> i32;

    /// Starts `argv` in the background and returns its id, or the launch
    /// failure code.
    fn spawn(&mut self, argv: &[String]) -> Result<u32, i32>;

    /// Terminates a process started by [`CommandRunner::spawn`] and reaps it.
    fn stop(&mut self, id: u32) -> i32;

    /// Handle to the command [`CommandRunner::run`] is waiting on, if the
    /// runner tracks one.
    fn foreground(&self) -> Option<Foreground> {
        None
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Box<R> {
    fn run(&mut self, argv: &[String]) -> i32 {
        (**self).run(argv)
    }

    fn spawn(&mut self, argv: &[String]) -> Result<u32, i32> {
        (**self).spawn(argv)
    }

    fn stop(&mut self, id: u32) -> i32 {
        (**self).stop(id)
    }

    fn foreground(&self) -> Option<Foreground> {
        (**self).foreground()
    }
}

/// Pid of the command a runner is currently waiting on.
///
/// The signal watcher passes a termination signal on to it, so a long
/// running tool cannot hold the cleanup stack hostage. Once closed nothing
/// is forwarded any more: teardown commands run to completion.
#[derive(Debug, Clone, Default)]
pub struct Foreground {
    pid: Arc<AtomicI32>,
    closed: Arc<AtomicBool>,
}

impl Foreground {
    pub fn set(&self, pid: u32) {
        self.pid.store(pid as i32, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Sends `signo` to the foreground command. Returns whether one was
    /// signalled.
    pub fn forward(&self, signo: libc::c_int) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return false;
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(pid, signo) == 0 }
    }
}

/// Where wrapped tools write their stdout and stderr.
///
/// Never the status channel: tool chatter stays out of the pass/fail report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Diagnostics {
    #[default]
    Null,
    Inherit,
    File(PathBuf),
}

impl Diagnostics {
    /// `null`, `inherit`, or anything else as a log file path.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "null" => Diagnostics::Null,
            "inherit" => Diagnostics::Inherit,
            path => Diagnostics::File(PathBuf::from(path)),
        }
    }

    fn stdio(&self) -> io::Result<(Stdio, Stdio)> {
        match self {
            Diagnostics::Null => Ok((Stdio::null(), Stdio::null())),
            Diagnostics::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            Diagnostics::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let err = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(err)))
            }
        }
    }
}

/// Runs commands on the host, optionally through `sudo`.
#[derive(Debug, Default)]
pub struct SystemRunner {
    diagnostics: Diagnostics,
    sudo: bool,
    foreground: Foreground,
    background: HashMap<u32, Child>,
}

impl SystemRunner {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            diagnostics,
            sudo: false,
            foreground: Foreground::default(),
            background: HashMap::new(),
        }
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn command(&self, argv: &[String]) -> Option<Command> {
        let Some((program, args)) = argv.split_first() else {
            warn!("refusing to run an empty command");
            return None;
        };

        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args).stdin(Stdio::null());

        match self.diagnostics.stdio() {
            Ok((out, err)) => {
                cmd.stdout(out).stderr(err);
            }
            Err(e) => {
                warn!(error = %e, "diagnostics sink unavailable, discarding tool output");
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Some(cmd)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, argv: &[String]) -> i32 {
        let Some(mut cmd) = self.command(argv) else {
            return 127;
        };

        let code = match cmd.spawn() {
            Ok(mut child) => {
                self.foreground.set(child.id());
                let waited = child.wait();
                self.foreground.clear();
                match waited {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        warn!(argv = ?argv, error = %e, "failed to wait for command");
                        255
                    }
                }
            }
            Err(e) => {
                warn!(argv = ?argv, error = %e, "failed to launch");
                launch_failure_code(&e)
            }
        };
        debug!(argv = ?argv, code, "command finished");
        code
    }

    fn spawn(&mut self, argv: &[String]) -> Result<u32, i32> {
        let mut cmd = self.command(argv).ok_or(127)?;
        match cmd.spawn() {
            Ok(child) => {
                let id = child.id();
                debug!(argv = ?argv, pid = id, "started in background");
                self.background.insert(id, child);
                Ok(id)
            }
            Err(e) => {
                warn!(argv = ?argv, error = %e, "failed to launch");
                Err(launch_failure_code(&e))
            }
        }
    }

    fn stop(&mut self, id: u32) -> i32 {
        let Some(mut child) = self.background.remove(&id) else {
            warn!(pid = id, "no such background process");
            return 1;
        };
        if matches!(child.try_wait(), Ok(None)) {
            // SAFETY: kill(2) has no memory-safety preconditions; the child
            // has not been reaped, so its pid is still ours.
            unsafe { libc::kill(id as libc::pid_t, libc::SIGTERM) };
        }
        match child.wait() {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(pid = id, error = %e, "failed to reap background process");
                255
            }
        }
    }

    fn foreground(&self) -> Option<Foreground> {
        Some(self.foreground.clone())
    }
}

impl Drop for SystemRunner {
    fn drop(&mut self) {
        for (id, child) in &mut self.background {
            debug!(pid = id, "killing leftover background process");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Logs commands instead of running them; every call succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(&mut self, argv: &[String]) -> i32 {
        info!(command = %argv.join(" "), "dry run");
        0
    }

    fn spawn(&mut self, argv: &[String]) -> Result<u32, i32> {
        info!(command = %argv.join(" "), "dry run (background)");
        Ok(0)
    }

    fn stop(&mut self, id: u32) -> i32 {
        info!(pid = id, "dry run (stop)");
        0
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(255)
}

// Same codes a POSIX shell reports for a command it could not start.
fn launch_failure_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => 127,
        _ => 126,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diagnostics_parse() {
        assert_eq!(Diagnostics::parse("null"), Diagnostics::Null);
        assert_eq!(Diagnostics::parse(""), Diagnostics::Null);
        assert_eq!(Diagnostics::parse("inherit"), Diagnostics::Inherit);
        assert_eq!(
            Diagnostics::parse("/tmp/vale.log"),
            Diagnostics::File(PathBuf::from("/tmp/vale.log"))
        );
    }

    #[test]
    fn system_runner_reports_exit_codes() {
        let mut runner = SystemRunner::new(Diagnostics::Null);
        assert_eq!(runner.run(&argv(&["sh", "-c", "exit 0"])), 0);
        assert_eq!(runner.run(&argv(&["sh", "-c", "exit 3"])), 3);
    }

    #[test]
    fn system_runner_maps_signal_death() {
        let mut runner = SystemRunner::new(Diagnostics::Null);
        assert_eq!(runner.run(&argv(&["sh", "-c", "kill -TERM $$"])), 143);
    }

    #[test]
    fn missing_binary_is_127() {
        let mut runner = SystemRunner::new(Diagnostics::Null);
        assert_eq!(runner.run(&argv(&["vale-harness-no-such-tool"])), 127);
        assert_eq!(runner.run(&[]), 127);
    }

    #[test]
    fn tool_output_goes_to_diagnostics_file() {
        let path = std::env::temp_dir().join(format!("vale-harness-diag-{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut runner = SystemRunner::new(Diagnostics::File(path.clone()));
        assert_eq!(runner.run(&argv(&["sh", "-c", "echo out; echo err >&2"])), 0);

        let logged = std::fs::read_to_string(&path).unwrap();
        assert!(logged.contains("out"));
        assert!(logged.contains("err"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn background_process_is_stopped_and_reaped() {
        let mut runner = SystemRunner::new(Diagnostics::Null);
        let id = runner.spawn(&argv(&["sleep", "30"])).unwrap();
        assert!(runner.background.contains_key(&id));
        assert_eq!(runner.stop(id), 128 + libc::SIGTERM);
        assert!(runner.background.is_empty());
        assert_eq!(runner.stop(id), 1);
        assert_eq!(runner.spawn(&argv(&["vale-harness-no-such-tool"])), Err(127));
    }

    #[test]
    fn forwarded_signal_ends_foreground_command() {
        let mut runner = SystemRunner::new(Diagnostics::Null);
        let fg = runner.foreground().unwrap();
        let forwarder = std::thread::spawn(move || {
            for _ in 0..500 {
                if fg.forward(libc::SIGTERM) {
                    return true;
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            false
        });
        assert_eq!(runner.run(&argv(&["sleep", "30"])), 143);
        assert!(forwarder.join().unwrap());
    }

    #[test]
    fn closed_foreground_forwards_nothing() {
        let fg = Foreground::default();
        assert!(!fg.forward(libc::SIGTERM));
        fg.set(std::process::id());
        fg.close();
        assert!(!fg.forward(0));
    }

    #[test]
    fn dry_run_always_succeeds() {
        assert_eq!(DryRunRunner.run(&argv(&["vale-ctl", "-n", "v0"])), 0);
        assert_eq!(DryRunRunner.spawn(&argv(&["fd_server"])), Ok(0));
    }
}

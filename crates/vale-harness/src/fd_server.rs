//! The descriptor server that keeps netmap ports open between test steps.
//!
//! It has to be stopped before ports it holds can be destroyed. Start and
//! stop are plain commands taken from the config. The server runs in the
//! foreground, so it is started in the background and reaped on exit.

use crate::cleanup::CleanupAction;
use crate::error::{Abort, HarnessError};
use crate::harness::Harness;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdServer {
    start: Vec<String>,
    stop: Vec<String>,
}

impl FdServer {
    pub fn new(start: Vec<String>, stop: Vec<String>) -> Self {
        Self { start, stop }
    }

    pub fn start_command(&self) -> Option<&[String]> {
        (!self.start.is_empty()).then_some(self.start.as_slice())
    }

    pub fn stop_command(&self) -> Option<&[String]> {
        (!self.stop.is_empty()).then_some(self.stop.as_slice())
    }
}

impl Harness {
    /// Starts the descriptor server and schedules its stop on exit: the
    /// configured stop command if there is one, then terminating whatever is
    /// left of the process.
    pub fn start_fd_server(&self) -> Result<(), Abort> {
        let start = self
            .fd_server
            .start_command()
            .ok_or_else(|| HarnessError::Config("fd_server.start is not configured".into()))?
            .to_vec();
        let stop = self.fd_server.stop_command().map(<[String]>::to_vec);
        self.acquire(0, "start fd_server", |runner| match runner.spawn(&start) {
            Ok(id) => {
                let cleanup = CleanupAction::new("stop fd_server", move |runner| {
                    if let Some(stop) = &stop {
                        runner.run(stop);
                    }
                    runner.stop(id);
                    Ok(())
                });
                (0, Some(cleanup))
            }
            Err(code) => (code, None),
        })
    }

    pub fn stop_fd_server(&self) -> Result<(), Abort> {
        let stop = self
            .fd_server
            .stop_command()
            .ok_or_else(|| HarnessError::Config("fd_server.stop is not configured".into()))?;
        self.run_guarded(stop, 0, "stop fd_server")
    }
}

//! VALE switch operations through `vale-ctl`.

use crate::cleanup::CleanupAction;
use crate::error::{Abort, HarnessError};
use crate::harness::Harness;

/// Argv builder for the bridge-control tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValeCtl {
    program: String,
}

impl Default for ValeCtl {
    fn default() -> Self {
        Self::new("vale-ctl")
    }
}

impl ValeCtl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Persistent virtual port.
    pub fn create_port(&self, port: &str) -> Vec<String> {
        self.argv("-n", port.to_string())
    }

    pub fn destroy_port(&self, port: &str) -> Vec<String> {
        self.argv("-r", port.to_string())
    }

    pub fn attach(&self, bridge: &str, port: &str) -> Result<Vec<String>, HarnessError> {
        Ok(self.argv("-a", endpoint(bridge, port)?))
    }

    pub fn detach(&self, bridge: &str, port: &str) -> Result<Vec<String>, HarnessError> {
        Ok(self.argv("-d", endpoint(bridge, port)?))
    }

    fn argv(&self, flag: &str, target: String) -> Vec<String> {
        vec![self.program.clone(), flag.to_string(), target]
    }
}

/// `<bridge>:<port>`, the switch port name `vale-ctl` expects.
pub fn endpoint(bridge: &str, port: &str) -> Result<String, HarnessError> {
    if !bridge.starts_with("vale") || bridge.contains(':') {
        return Err(HarnessError::InvalidBridge(bridge.to_string()));
    }
    Ok(format!("{bridge}:{port}"))
}

impl Harness {
    /// Creates `port`. If the port came into existence, its teardown (stop
    /// the descriptor server, then destroy the port) goes on the stack.
    pub fn create_port(&self, port: &str, expected: i32) -> Result<(), Abort> {
        let create = self.vale.create_port(port);
        let stop = self.fd_server.stop_command().map(<[String]>::to_vec);
        let destroy = self.vale.destroy_port(port);
        let cleanup = CleanupAction::new(format!("destroy vale port {port}"), move |runner| {
            if let Some(stop) = &stop {
                runner.run(stop);
            }
            let code = runner.run(&destroy);
            if code != 0 {
                return Err(HarnessError::CommandFailed {
                    argv: destroy.join(" "),
                    code,
                });
            }
            Ok(())
        });
        self.acquire(expected, &format!("create vale port {port}"), |runner| {
            (runner.run(&create), Some(cleanup))
        })
    }

    /// Destroys `port`. The descriptor server holds ports open, so it is
    /// stopped first.
    pub fn destroy_port(&self, port: &str, expected: i32) -> Result<(), Abort> {
        if self.fd_server.stop_command().is_some() {
            self.stop_fd_server()?;
        }
        self.run_guarded(
            &self.vale.destroy_port(port),
            expected,
            &format!("destroy vale port {port}"),
        )
    }

    /// Attaches `port` to `bridge`; a successful attach is detached on exit.
    pub fn attach(&self, bridge: &str, port: &str, expected: i32) -> Result<(), Abort> {
        let attach = self.vale.attach(bridge, port)?;
        let cleanup = CleanupAction::commands(
            format!("detach {port} from {bridge}"),
            vec![self.vale.detach(bridge, port)?],
        );
        self.acquire(expected, &format!("attach {port} to {bridge}"), |runner| {
            (runner.run(&attach), Some(cleanup))
        })
    }

    pub fn detach(&self, bridge: &str, port: &str, expected: i32) -> Result<(), Abort> {
        self.run_guarded(
            &self.vale.detach(bridge, port)?,
            expected,
            &format!("detach {port} from {bridge}"),
        )
    }
}

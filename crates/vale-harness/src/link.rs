//! veth pairs through `ip link`.

use crate::cleanup::CleanupAction;
use crate::error::{Abort, HarnessError};
use crate::harness::Harness;

/// Linux interface names are capped at 15 bytes (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLink {
    program: String,
}

impl Default for IpLink {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpLink {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn add_veth(&self, name: &str, peer: &str) -> Vec<String> {
        self.argv(&["add", name, "type", "veth", "peer", "name", peer])
    }

    pub fn set_up(&self, name: &str) -> Vec<String> {
        self.argv(&["set", name, "up"])
    }

    /// Deleting either end of a veth pair removes both.
    pub fn delete(&self, name: &str) -> Vec<String> {
        self.argv(&["del", name])
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.program.clone(), "link".to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }
}

pub fn validate_ifname(name: &str) -> Result<(), HarnessError> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN || name.contains(['/', ' ', ':']) {
        return Err(HarnessError::Config(format!(
            "invalid interface name {name:?}"
        )));
    }
    Ok(())
}

impl Harness {
    /// Creates the pair `name`/`peer` and brings both ends up.
    ///
    /// Teardown deletes `name` (taking `peer` with it) and then stops the
    /// descriptor server. It is registered whenever the pair was created,
    /// even if the creation was expected to fail.
    pub fn create_veth_pair(&self, name: &str, peer: &str, expected: i32) -> Result<(), Abort> {
        validate_ifname(name)?;
        validate_ifname(peer)?;

        let add = self.ip.add_veth(name, peer);
        let delete = self.ip.delete(name);
        let stop = self.fd_server.stop_command().map(<[String]>::to_vec);
        let cleanup = CleanupAction::new(format!("delete veth {name}"), move |runner| {
            let code = runner.run(&delete);
            if let Some(stop) = &stop {
                runner.run(stop);
            }
            if code != 0 {
                return Err(HarnessError::CommandFailed {
                    argv: delete.join(" "),
                    code,
                });
            }
            Ok(())
        });
        self.acquire(expected, &format!("create veth pair {name}/{peer}"), |runner| {
            (runner.run(&add), Some(cleanup))
        })?;
        if expected != 0 {
            return Ok(());
        }

        for end in [name, peer] {
            self.run_guarded(&self.ip.set_up(end), 0, &format!("set {end} up"))?;
        }
        Ok(())
    }

    pub fn delete_link(&self, name: &str, expected: i32) -> Result<(), Abort> {
        self.run_guarded(&self.ip.delete(name), expected, &format!("delete link {name}"))
    }
}

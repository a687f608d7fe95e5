//! Scenario configuration (TOML).
//!
//! Parsed into `*Input` structs where every field is optional, then resolved
//! into a validated [`HarnessConfig`]. Step tables are checked up front so a
//! typo fails before any resource is created.

use serde::Deserialize;

use crate::error::HarnessError;
use crate::fd_server::FdServer;
use crate::link::{validate_ifname, IpLink};
use crate::runner::Diagnostics;
use crate::scenario::{Action, Step};
use crate::vale::{endpoint, ValeCtl};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfigInput {
    pub version: u32,
    pub name: Option<String>,
    pub sudo: bool,
    pub tools: ToolsConfigInput,
    pub fd_server: FdServerConfigInput,
    pub output: OutputConfigInput,
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfigInput {
    pub vale_ctl: Option<String>,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FdServerConfigInput {
    pub start: Vec<String>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfigInput {
    pub diagnostics: Option<String>,
}

/// One `[[steps]]` table. Which fields are required depends on `op`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StepInput {
    pub op: String,
    pub name: Option<String>,
    pub peer: Option<String>,
    pub bridge: Option<String>,
    pub port: Option<String>,
    pub argv: Vec<String>,
    pub label: Option<String>,
    pub reason: Option<String>,
    pub expect: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub version: u32,
    pub name: Option<String>,
    pub sudo: bool,
    pub vale: ValeCtl,
    pub ip: IpLink,
    pub fd_server: FdServer,
    pub diagnostics: Diagnostics,
    pub steps: Vec<Step>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            name: None,
            sudo: false,
            vale: ValeCtl::default(),
            ip: IpLink::default(),
            fd_server: FdServer::default(),
            diagnostics: Diagnostics::default(),
            steps: Vec::new(),
        }
    }
}

impl StepInput {
    fn require(&self, idx: usize, field: &str, value: &Option<String>) -> Result<String, HarnessError> {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Ok(v.to_string()),
            _ => Err(HarnessError::Config(format!(
                "step {idx} ({}): missing `{field}`",
                self.op
            ))),
        }
    }

    pub fn resolve(self, idx: usize) -> Result<Step, HarnessError> {
        let action = match self.op.trim() {
            "create-port" => Action::CreatePort {
                name: self.require(idx, "name", &self.name)?,
            },
            "destroy-port" => Action::DestroyPort {
                name: self.require(idx, "name", &self.name)?,
            },
            "attach" | "detach" => {
                let bridge = self.require(idx, "bridge", &self.bridge)?;
                let port = self.require(idx, "port", &self.port)?;
                endpoint(&bridge, &port)?;
                if self.op.trim() == "attach" {
                    Action::Attach { bridge, port }
                } else {
                    Action::Detach { bridge, port }
                }
            }
            "create-veth" => {
                let name = self.require(idx, "name", &self.name)?;
                let peer = self.require(idx, "peer", &self.peer)?;
                validate_ifname(&name)?;
                validate_ifname(&peer)?;
                Action::CreateVeth { name, peer }
            }
            "delete-link" => Action::DeleteLink {
                name: self.require(idx, "name", &self.name)?,
            },
            "start-fd-server" => Action::StartFdServer,
            "stop-fd-server" => Action::StopFdServer,
            "run" => {
                if self.argv.is_empty() {
                    return Err(HarnessError::Config(format!(
                        "step {idx} (run): missing `argv`"
                    )));
                }
                let label = self
                    .label
                    .clone()
                    .unwrap_or_else(|| self.argv.join(" "));
                Action::Run {
                    argv: self.argv.clone(),
                    label,
                }
            }
            "fail" => Action::Fail {
                reason: self.require(idx, "reason", &self.reason)?,
            },
            other => {
                return Err(HarnessError::Config(format!(
                    "step {idx}: unknown op {other:?}"
                )))
            }
        };
        Ok(Step {
            action,
            expect: self.expect.unwrap_or(0),
        })
    }
}

impl HarnessConfigInput {
    pub fn resolve(self) -> Result<HarnessConfig, HarnessError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(HarnessError::Config(format!(
                "unsupported config version {version}"
            )));
        }

        let defaults = HarnessConfig::default();
        let vale = self
            .tools
            .vale_ctl
            .filter(|p| !p.trim().is_empty())
            .map(ValeCtl::new)
            .unwrap_or(defaults.vale);
        let ip = self
            .tools
            .ip
            .filter(|p| !p.trim().is_empty())
            .map(IpLink::new)
            .unwrap_or(defaults.ip);

        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(idx, step)| step.resolve(idx))
            .collect::<Result<Vec<_>, _>>()?;

        let name = self.name.and_then(|name| {
            let trimmed = name.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

        Ok(HarnessConfig {
            version,
            name,
            sudo: self.sudo,
            vale,
            ip,
            fd_server: FdServer::new(self.fd_server.start, self.fd_server.stop),
            diagnostics: self
                .output
                .diagnostics
                .as_deref()
                .map(Diagnostics::parse)
                .unwrap_or_default(),
            steps,
        })
    }
}

impl HarnessConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, HarnessError> {
        if input.trim().is_empty() {
            return Ok(HarnessConfig::default());
        }
        let parsed: HarnessConfigInput = toml::from_str(input)
            .map_err(|e| HarnessError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_full_config() {
        let toml = r#"
            version = 1
            name = "vale-attach"
            sudo = true

            [tools]
            vale_ctl = "/usr/local/bin/vale-ctl"

            [fd_server]
            start = ["fd_server"]
            stop = ["pkill", "-x", "fd_server"]

            [output]
            diagnostics = "/tmp/vale-attach.log"

            [[steps]]
            op = "create-port"
            name = "v0"

            [[steps]]
            op = "attach"
            bridge = "vale0"
            port = "v0"

            [[steps]]
            op = "attach"
            bridge = "vale0"
            port = "v0"
            expect = 1

            [[steps]]
            op = "run"
            argv = ["pkt-gen", "-i", "vale0:v0", "-f", "tx", "-n", "1000"]
            label = "transmit"
        "#;

        let cfg = HarnessConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.name.as_deref(), Some("vale-attach"));
        assert!(cfg.sudo);
        assert_eq!(cfg.vale, ValeCtl::new("/usr/local/bin/vale-ctl"));
        assert_eq!(cfg.ip, IpLink::default());
        assert_eq!(
            cfg.fd_server.stop_command().map(|c| c.join(" ")).as_deref(),
            Some("pkill -x fd_server")
        );
        assert_eq!(
            cfg.diagnostics,
            Diagnostics::File(PathBuf::from("/tmp/vale-attach.log"))
        );
        assert_eq!(cfg.steps.len(), 4);
        assert_eq!(
            cfg.steps[0],
            Step::new(Action::CreatePort { name: "v0".into() })
        );
        assert_eq!(cfg.steps[2].expect, 1);
        assert!(matches!(
            &cfg.steps[3].action,
            Action::Run { label, .. } if label == "transmit"
        ));
    }

    #[test]
    fn empty_input_is_default() {
        let cfg = HarnessConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert!(cfg.steps.is_empty());
        assert_eq!(cfg.diagnostics, Diagnostics::Null);
        assert!(cfg.fd_server.start_command().is_none());
    }

    #[test]
    fn run_label_defaults_to_command() {
        let cfg = HarnessConfig::from_toml_str(
            r#"
            [[steps]]
            op = "run"
            argv = ["ping", "-c", "1", "10.0.0.2"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            &cfg.steps[0].action,
            Action::Run { label, .. } if label == "ping -c 1 10.0.0.2"
        ));
    }

    #[test]
    fn rejects_bad_configs() {
        let cases = [
            "version = 2",
            "[[steps]]\nop = \"create-port\"",
            "[[steps]]\nop = \"attach\"\nbridge = \"br0\"\nport = \"v0\"",
            "[[steps]]\nop = \"create-veth\"\nname = \"veth0\"",
            "[[steps]]\nop = \"run\"",
            "[[steps]]\nop = \"teleport\"",
            "steps = 3",
        ];
        for case in cases {
            assert!(
                matches!(HarnessConfig::from_toml_str(case), Err(HarnessError::Config(_))
                    | Err(HarnessError::InvalidBridge(_))),
                "accepted: {case}"
            );
        }
    }
}

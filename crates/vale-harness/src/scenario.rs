//! Declarative test scenarios: an ordered list of guarded steps.

use tracing::{debug, info};

use crate::error::Abort;
use crate::harness::Harness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreatePort { name: String },
    DestroyPort { name: String },
    Attach { bridge: String, port: String },
    Detach { bridge: String, port: String },
    CreateVeth { name: String, peer: String },
    DeleteLink { name: String },
    StartFdServer,
    StopFdServer,
    /// Arbitrary command, e.g. a traffic generator.
    Run { argv: Vec<String>, label: String },
    /// Explicit test failure.
    Fail { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub action: Action,
    /// Exit code the step's command must return.
    pub expect: i32,
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self { action, expect: 0 }
    }

    pub fn expecting(mut self, code: i32) -> Self {
        self.expect = code;
        self
    }

    pub fn execute(&self, harness: &Harness) -> Result<(), Abort> {
        let expect = self.expect;
        match &self.action {
            Action::CreatePort { name } => harness.create_port(name, expect),
            Action::DestroyPort { name } => harness.destroy_port(name, expect),
            Action::Attach { bridge, port } => harness.attach(bridge, port, expect),
            Action::Detach { bridge, port } => harness.detach(bridge, port, expect),
            Action::CreateVeth { name, peer } => harness.create_veth_pair(name, peer, expect),
            Action::DeleteLink { name } => harness.delete_link(name, expect),
            Action::StartFdServer => harness.start_fd_server(),
            Action::StopFdServer => harness.stop_fd_server(),
            Action::Run { argv, label } => harness.run_guarded(argv, expect, label),
            Action::Fail { reason } => Err(harness.fail(reason)),
        }
    }

    fn is_test_body(&self) -> bool {
        matches!(self.action, Action::Run { .. } | Action::Fail { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

/// Runs every step in order, stopping at the first fatal one, and writes the
/// success line when all of them pass. Cleanup is left to
/// [`Harness::finish`].
pub fn run_scenario(harness: &Harness, scenario: &Scenario) -> Result<(), Abort> {
    info!(scenario = %scenario.name, steps = scenario.steps.len(), "running scenario");
    for (idx, step) in scenario.steps.iter().enumerate() {
        if step.is_test_body() {
            harness.mark_running();
        }
        debug!(step = idx, action = ?step.action, expect = step.expect, "step");
        step.execute(harness)?;
    }
    harness.success(&scenario.name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Phase;
    use crate::status::StatusChannel;
    use crate::test_util::{ScriptedRunner, SharedBuffer};

    #[test]
    fn passing_scenario_reports_success() {
        let runner = ScriptedRunner::new();
        let calls = runner.call_log();
        let buf = SharedBuffer::new();
        let h = Harness::new(runner, StatusChannel::new(buf.clone()));
        let scenario = Scenario::new(
            "bdg-simple",
            vec![
                Step::new(Action::CreatePort { name: "v0".into() }),
                Step::new(Action::Run {
                    argv: vec!["pkt-gen".into(), "-i".into(), "vale0:v0".into()],
                    label: "pkt-gen".into(),
                }),
            ],
        );

        run_scenario(&h, &scenario).unwrap();
        assert_eq!(h.phase(), Phase::Running);
        assert_eq!(buf.lines(), vec!["bdg-simple: success."]);
        assert_eq!(h.finish(Ok(())), 0);
        assert_eq!(
            calls.commands(),
            vec!["vale-ctl -n v0", "pkt-gen -i vale0:v0", "vale-ctl -r v0"]
        );
    }

    #[test]
    fn fail_step_stops_the_run() {
        let runner = ScriptedRunner::new();
        let calls = runner.call_log();
        let buf = SharedBuffer::new();
        let h = Harness::new(runner, StatusChannel::new(buf.clone()).with_tag("t"));
        let scenario = Scenario::new(
            "t",
            vec![
                Step::new(Action::Fail {
                    reason: "not implemented on this kernel".into(),
                }),
                Step::new(Action::CreatePort { name: "v0".into() }),
            ],
        );

        let outcome = run_scenario(&h, &scenario);
        assert!(matches!(outcome, Err(Abort::Failed(_))));
        assert_eq!(buf.lines(), vec!["t: not implemented on this kernel FAIL."]);
        assert_eq!(h.finish(outcome), 1);
        assert!(calls.is_empty());
    }
}

//! vale-harness
//!
//! Runs a TOML-described VALE / veth test scenario. Every step is a guarded
//! call; whatever was set up before a failure or a signal is torn down in
//! reverse order before the process exits.
//!
//! - Status lines (`<name>: success.` / `... FAIL(...)`) go to stdout
//! - Logs go to stderr (`RUST_LOG`, default `info`)
//! - Output of the wrapped tools goes to the diagnostics sink

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vale_harness::config::HarnessConfig;
use vale_harness::scenario::{run_scenario, Scenario};
use vale_harness::{CommandRunner, Diagnostics, DryRunRunner, Harness, StatusChannel, SystemRunner};

#[derive(Parser, Debug)]
#[command(name = "vale-harness", about = "Run a VALE / veth test scenario")]
struct Cli {
    /// Scenario file (TOML).
    scenario: PathBuf,

    /// Log the commands instead of running them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Where wrapped tools write their output: `null`, `inherit` or a file path.
    /// Overrides `output.diagnostics`.
    #[arg(long)]
    diagnostics: Option<String>,

    /// Leading label of status lines. Defaults to the scenario name.
    #[arg(long)]
    tag: Option<String>,

    /// Run every command through sudo.
    #[arg(long, default_value_t = false)]
    sudo: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let input = std::fs::read_to_string(&cli.scenario)
        .with_context(|| format!("reading {}", cli.scenario.display()))?;
    let config = HarnessConfig::from_toml_str(&input)
        .with_context(|| format!("loading {}", cli.scenario.display()))?;

    let name = config.name.clone().unwrap_or_else(|| {
        cli.scenario
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vale-harness".into())
    });
    let diagnostics = cli
        .diagnostics
        .as_deref()
        .map(Diagnostics::parse)
        .unwrap_or_else(|| config.diagnostics.clone());

    let runner: Box<dyn CommandRunner + Send> = if cli.dry_run {
        Box::new(DryRunRunner)
    } else {
        Box::new(SystemRunner::new(diagnostics).with_sudo(cli.sudo || config.sudo))
    };
    let status = StatusChannel::stdout().with_tag(cli.tag.unwrap_or_else(|| name.clone()));
    let harness = Harness::new(runner, status).with_tools(
        config.vale.clone(),
        config.ip.clone(),
        config.fd_server.clone(),
    );
    harness.install_signal_handlers()?;

    tracing::info!(
        scenario = %name,
        steps = config.steps.len(),
        dry_run = cli.dry_run,
        "vale-harness starting"
    );

    let scenario = Scenario::new(name, config.steps);
    let outcome = run_scenario(&harness, &scenario);
    let status = harness.finish(outcome);

    tracing::info!(status, "vale-harness finished");
    std::process::exit(status);
}

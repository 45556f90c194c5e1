use stdfuzz_core::campaign::{Campaign, CampaignReport, FailurePolicy};
use stdfuzz_core::config::FuzzConfig;
use stdfuzz_core::observer::ConsoleObserver;

use anyhow::bail;
use clap::{CommandFactory, Parser, ValueEnum};
use log::{debug, error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_CONFIG_FILE: &str = "stdfuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Target command, resolved against the working directory and run through the shell.
    command: Option<String>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    working_dir: Option<PathBuf>,
    /// Seed input that every mutator starts from.
    #[clap(long)]
    seed: Option<String>,
    /// How many times each dynamic mutator kind is instantiated.
    #[clap(long)]
    repeat_count: Option<usize>,
    #[clap(long)]
    rng_seed: Option<u64>,
    /// Per-execution deadline; 0 waits forever.
    #[clap(long)]
    timeout_ms: Option<u64>,
    #[clap(long, value_enum)]
    failure_policy: Option<PolicyArg>,
    /// Print the final report as JSON instead of per-input lines.
    #[clap(long)]
    json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum PolicyArg {
    Halt,
    Record,
}

impl From<PolicyArg> for FailurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Halt => FailurePolicy::Halt,
            PolicyArg::Record => FailurePolicy::Record,
        }
    }
}

fn load_config(config_file: Option<&Path>) -> Result<FuzzConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            FuzzConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                FuzzConfig::load_from_file(default_config_path)
            } else {
                info!("No config file specified and no {DEFAULT_CONFIG_FILE}, using defaults");
                Ok(FuzzConfig::default())
            }
        }
    }
}

fn apply_overrides(cli: &Cli, config: &mut FuzzConfig) {
    if let Some(command) = &cli.command {
        config.executor.command = Some(command.clone());
    }
    if let Some(working_dir) = &cli.working_dir {
        config.executor.working_dir = working_dir.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if let Some(seed) = &cli.seed {
        config.campaign.seed = seed.clone();
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.campaign.rng_seed = Some(rng_seed);
    }
    if let Some(policy) = cli.failure_policy {
        config.campaign.failure_policy = policy.into();
    }
    if let Some(repeat_count) = cli.repeat_count {
        config.mutators.dynamic.repeat_count = repeat_count;
    }
}

fn run(cli: Cli) -> Result<CampaignReport, anyhow::Error> {
    let mut config = load_config(cli.config_file.as_deref())?;
    apply_overrides(&cli, &mut config);
    if config.executor.command.is_none() {
        bail!("No target command given\n\n{}", Cli::command().render_usage());
    }
    config.validate()?;
    let target = config.executor.ensure_command_exists()?;
    info!("Target: {target:?}");

    let mut campaign = Campaign::from_config(&config)?;
    if !cli.json {
        campaign.add_observer(Box::new(ConsoleObserver::stdout()));
    }
    let report = campaign.run()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(report)
}

/// Prints a parse outcome clap reports as an error: `--help`/`--version` succeed, usage errors fail.
fn exit_for_parse_error(e: &clap::Error) -> ExitCode {
    if let Err(print_err) = e.print() {
        debug!("Could not print usage: {print_err}");
    }
    if e.use_stderr() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => return exit_for_parse_error(&e),
    };

    match run(cli) {
        Ok(report) if report.has_findings() => {
            error!(
                "{} of {} executions were not accepted (rng seed {})",
                report.findings.len(),
                report.executions,
                report.rng_seed
            );
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

mod config;
mod runner;
mod scenario;
mod sim_device;
mod workload;

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use crate::config::Cli;
use crate::config::Commands;
use crate::config::OutputFormat;
use crate::config::RunArgs;
use crate::config::ValidateArgs;
use crate::runner::RunOptions;
use crate::scenario::Scenario;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run_scenario(run_args).await,
        Commands::Validate(validate_args) => validate_scenario(validate_args),
    }
}

async fn run_scenario(run_args: RunArgs) -> Result<()> {
    let _guard = match &run_args.stats_file {
        Some(path) => Some(utils::logging::init_with_stats_file(path)?),
        None => {
            utils::logging::init();
            None
        }
    };

    let scenario = Scenario::load(&run_args.scenario)
        .with_context(|| format!("loading {}", run_args.scenario.display()))?;
    let mut options = RunOptions::for_scenario(&scenario);
    if let Some(duration_ms) = run_args.duration_ms {
        options.duration = Duration::from_millis(duration_ms);
    }
    options.stats_interval = (run_args.stats_interval_ms > 0)
        .then(|| Duration::from_millis(run_args.stats_interval_ms));

    tracing::info!(scenario = %run_args.scenario.display(), "starting fq-sim");
    let report = runner::run(&scenario, options).await?;

    match run_args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{report}"),
    }
    Ok(())
}

fn validate_scenario(validate_args: ValidateArgs) -> Result<()> {
    let scenario = Scenario::load(&validate_args.scenario)
        .with_context(|| format!("loading {}", validate_args.scenario.display()))?;
    println!(
        "{}: {} device(s), {} workload(s), {} ms",
        validate_args.scenario.display(),
        scenario.devices.len(),
        scenario.workloads.len(),
        scenario.duration_ms
    );
    Ok(())
}

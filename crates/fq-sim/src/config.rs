use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

#[derive(Parser)]
#[command(about = "Drive simulated disks and workloads through the fair-queuing scheduler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario and print a report
    Run(RunArgs),
    /// Check a scenario file without running it
    Validate(ValidateArgs),
}

#[derive(Parser)]
pub struct RunArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "Scenario file (YAML) describing devices and workloads"
    )]
    pub scenario: PathBuf,

    #[arg(
        long,
        env = "FQ_SIM_STATS_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Write periodic scheduler stats to this file (rotated daily), e.g. /tmp/fq-stats.log"
    )]
    pub stats_file: Option<PathBuf>,

    #[arg(long, help = "Override the scenario duration, in milliseconds")]
    pub duration_ms: Option<u64>,

    #[arg(
        long,
        default_value = "1000",
        help = "Interval between stats snapshots, in milliseconds; 0 disables them"
    )]
    pub stats_interval_ms: u64,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

#[derive(Parser)]
pub struct ValidateArgs {
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub scenario: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

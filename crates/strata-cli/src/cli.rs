use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use strata::core::models::calculation::Task;
use strata::core::models::optimisation::OptimisationStrategy;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author = "Strata Developers",
    version,
    about = "Strata CLI - drive multi-layer ONIOM single points and geometry optimisations through external quantum chemistry programs.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single point or a geometry optimisation described by a job file.
    Run(RunArgs),
    /// Validate a job file and print its layer layout without running anything.
    Check(CheckArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the job file in TOML format.
    #[arg(short = 'c', long, required = true, value_name = "PATH")]
    pub job: PathBuf,

    /// Override the geometry file named in the job file.
    #[arg(long, value_name = "PATH")]
    pub xyz: Option<PathBuf>,

    /// Write the final geometry to this XYZ file.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Override the job type.
    #[arg(long, value_enum, value_name = "KIND")]
    pub mode: Option<JobMode>,

    /// Override the derivative order of a single point.
    #[arg(long, value_enum, value_name = "TASK")]
    pub task: Option<TaskArg>,

    /// Override the optimisation strategy of the root layer.
    #[arg(long, value_enum, value_name = "STRATEGY")]
    pub strategy: Option<StrategyArg>,

    /// Override job file values, e.g. `-S job.task=hessian`.
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `check` subcommand.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the job file in TOML format.
    #[arg(short = 'c', long, required = true, value_name = "PATH")]
    pub job: PathBuf,

    /// Override the geometry file named in the job file.
    #[arg(long, value_name = "PATH")]
    pub xyz: Option<PathBuf>,

    /// Override job file values, e.g. `-S job.bond-tolerance=1.3`.
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobMode {
    SinglePoint,
    Optimise,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskArg {
    Energy,
    Gradient,
    Hessian,
}

impl From<TaskArg> for Task {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::Energy => Task::Energy,
            TaskArg::Gradient => Task::Gradient,
            TaskArg::Hessian => Task::Hessian,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyArg {
    Macro,
    Micro,
}

impl From<StrategyArg> for OptimisationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Macro => OptimisationStrategy::Macro,
            StrategyArg::Micro => OptimisationStrategy::Micro,
        }
    }
}

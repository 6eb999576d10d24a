#![forbid(unsafe_code)]

mod ado;
mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "trainyard: release-train grouping for Azure DevOps boards",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format (overrides `FORMAT`).
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Extra config file, applied over the user and project files.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Derive the output mode from flags and environment.
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Group, link and reconcile release trains",
        long_about = "Scan ranked work items for release-train markers, create or update one \
                      aggregate per group, reconcile stored estimates, and run hygiene checks.",
        after_help = "EXAMPLES:\n    # Run every pass against Azure DevOps\n    trainyard run --area 'Fabrikam\\Platform'\n\n    # Only reconcile estimates, correcting manual aggregates too\n    trainyard run --pass estimate-reconcile --reconcile-all\n\n    # Dry run against captured data\n    trainyard run --fixture backlog.json --json"
    )]
    Run(cmd::run::RunArgs),

    #[command(
        about = "Show how titles are classified",
        long_about = "Classify titles as opening markers, separators or plain items.",
        after_help = "EXAMPLES:\n    trainyard classify '----- Q1 Release -----rt:42' '------------' 'Feature A'"
    )]
    Classify(cmd::classify::ClassifyArgs),
}

fn default_filter(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "trainyard=debug,info"
    } else {
        "trainyard=info,warn"
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env("TRAINYARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, quiet)));

    let format = env::var("TRAINYARD_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    debug!(?cli, "parsed arguments");

    let project_root = env::current_dir()?;
    let output = cli.output_mode();
    let config = cli.config.as_deref();

    match &cli.command {
        Commands::Run(args) => cmd::run::run_run(args, config, output, &project_root),
        Commands::Classify(args) => {
            cmd::classify::run_classify(args, config, output, &project_root)
        }
    }
}

//! Retail KPI stream CLI
//!
//! Runs the micro-batch engine and inspects its checkpoints.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{CheckpointCommand, RunCommand};
use processor::config::{LoggingConfig, ProcessorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "retail-kpi",
    version,
    about = "Exactly-once tumbling-window KPIs over a retail transaction stream",
    long_about = "Reads retail transactions from a replayable source and writes\n\
                  per-minute KPIs globally and per country.\n\n\
                  Every tick delivers its output and then commits a checkpoint,\n\
                  so a restart resumes exactly where the last tick committed."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        env = "RETAIL_KPI_CONFIG",
        help = "Path to a YAML configuration file"
    )]
    config: Option<std::path::PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming engine
    #[command(name = "run", about = "Run the streaming engine until interrupted")]
    Run(RunCommand),

    /// Checkpoint inspection
    #[command(name = "checkpoint", about = "Inspect committed checkpoints")]
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ProcessorConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    init_tracing(&config.logging, cli.verbose);

    match cli.command {
        Commands::Run(command) => command.execute(config).await,
        Commands::Checkpoint { command } => command.execute(&config).await,
    }
}

/// Initialize tracing; `RUST_LOG` overrides the configured level
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new(&logging.level)
        }
    });

    // Console output owns stdout
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

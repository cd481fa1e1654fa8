//! canflash - topology checks, trace replay and simulated updates
//!
//! Usage:
//!   canflash [OPTIONS] <COMMAND>
//!
//! Settings come from a TOML config file (`--config`); command-line
//! arguments override the topology and bus index given there.

mod commands;
mod config;
mod replay;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

const DEFAULT_LOG_FILTER: &str = "canflash=info,canflash_update=debug";

#[derive(Parser)]
#[command(name = "canflash")]
#[command(author, version, about = "CAN network flashing and trace tool")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CANFLASH_CONFIG")]
    config: Option<PathBuf>,

    /// Network description, overrides the config file
    #[arg(short, long, global = true)]
    topology: Option<PathBuf>,

    /// Index of the bus the tester is attached to, overrides the config file
    #[arg(short, long, global = true)]
    bus_index: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a topology and show which nodes are reachable
    Check,

    /// Interpret a recorded frame file into trace files
    Replay {
        /// Frame file, one `<time> <id>[x] [r] <dlc> <bytes>` line per frame
        input: PathBuf,

        /// Additional trace file (.asc or .blf), may be repeated
        #[arg(short, long = "output")]
        outputs: Vec<PathBuf>,
    },

    /// Run the full update sequence against a simulated network
    SimulateUpdate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(bus_index) = cli.bus_index {
        config.bus_index = bus_index;
    }

    match &cli.command {
        Commands::Check => {
            let topology = config.topology_path(cli.topology.as_deref())?;
            commands::check(&topology, config.bus_index)?;
        }

        Commands::Replay { input, outputs } => {
            let summary = commands::replay(&config, cli.topology.as_deref(), input, outputs)?;
            println!(
                "{} frames read, {} interpreted",
                summary.frames, summary.interpreted
            );
            for path in &summary.trace_files {
                println!("  wrote {}", path.display());
            }
        }

        Commands::SimulateUpdate => {
            let topology = config.topology_path(cli.topology.as_deref())?;
            commands::simulate_update(&config, &topology).await?;
        }
    }

    Ok(())
}

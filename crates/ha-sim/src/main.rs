//! ha-sim: Run the heartbeat failure detector over a simulated cluster.
//!
//! Every instance runs the real protocol on a shared logical clock, so a
//! run is reproducible from its configuration and seed.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ha_sim::{ScheduledEvent, Simulation, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "ha-sim")]
#[command(about = "Simulate quorum heartbeat failure detection")]
struct Args {
    /// YAML simulation config (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of members, numbered from 1 (overrides config)
    #[arg(short, long)]
    members: Option<u32>,

    /// Simulated duration in milliseconds (overrides config)
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Seed for message loss (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Crash an instance, as INSTANCE@MS (repeatable)
    #[arg(long)]
    crash: Vec<ScheduledEvent>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,ha_sim=debug,ha_core=debug"
    } else {
        "info,ha_sim=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => SimulationConfig::load(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(members) = args.members {
        config.members = (1..=members).collect();
    }
    if let Some(duration_ms) = args.duration_ms {
        config.duration_ms = duration_ms;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.events.extend(args.crash);

    info!("Members: {:?}", config.members);
    let report = Simulation::new(config)?.run();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

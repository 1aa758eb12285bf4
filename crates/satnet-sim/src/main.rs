//! Satellite access network scenario runner
//!
//! Builds a scenario from JSON, replays its handovers and dumps the
//! resulting route and ARP state of every node.
//!
//! Usage:
//!   satnet-sim --scenario scenarios/two-gateways.json \
//!              --until 30 \
//!              --output snapshot.json

use anyhow::Result;
use beam_routing::{duration_from_secs, ScenarioBuilder, ScenarioConfig};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(
    name = "satnet-sim",
    about = "Replay beam handovers and dump route / ARP state"
)]
struct Args {
    /// Scenario JSON file
    #[arg(short, long)]
    scenario: PathBuf,

    /// Simulated time to run to, in seconds (default: last handover)
    #[arg(short, long)]
    until: Option<f64>,

    /// Snapshot output file (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ScenarioConfig::load(&args.scenario)?;
    let until_s = args.until.unwrap_or_else(|| config.last_handover_s());
    let until = duration_from_secs(until_s, "--until value")?;

    let mut scenario = ScenarioBuilder::build(&config)?;
    let executed = scenario.run_until(until)?;

    let snapshot = scenario.snapshot();
    match &args.output {
        Some(path) => {
            info!("Writing snapshot to {:?}", path);
            let writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(writer, &snapshot)?;
        }
        None => {
            let mut writer = BufWriter::new(io::stdout().lock());
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
            writeln!(writer)?;
        }
    }

    info!(
        "{} handovers executed by t = {:.3} s, {} still queued",
        executed,
        until_s,
        scenario.pending_handovers()
    );
    Ok(())
}

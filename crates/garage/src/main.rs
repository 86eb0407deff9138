//! Garage: maintenance-window scheduler CLI.
//!
//! Subcommands:
//! - `simulate`: run one maintenance window against a scripted job engine

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use garage_mode::GarageTimings;

mod sim;

#[derive(Parser)]
#[command(name = "garage")]
#[command(about = "Maintenance-window scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one maintenance window against a scripted job engine
    Simulate {
        /// Scenario file (JSON). Uses a built-in scenario when omitted.
        #[arg(long, env = "GARAGE_SCENARIO")]
        scenario: Option<PathBuf>,

        /// Delay before the first idle-job snapshot, in milliseconds
        #[arg(long, default_value = "1000")]
        initial_delay_ms: u64,

        /// Interval between idle-job snapshots, in milliseconds
        #[arg(long, default_value = "250")]
        poll_interval_ms: u64,

        /// Interval between session teardown checks, in milliseconds
        #[arg(long, default_value = "500")]
        stop_check_interval_ms: u64,

        /// Cancel the window after this many milliseconds instead of waiting
        /// for idle work to drain
        #[arg(long)]
        cancel_after_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "garage=info,garage_mode=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            scenario,
            initial_delay_ms,
            poll_interval_ms,
            stop_check_interval_ms,
            cancel_after_ms,
        } => {
            let scenario = match scenario {
                Some(path) => sim::Scenario::load(&path)?,
                None => sim::Scenario::builtin(),
            };
            let timings = GarageTimings {
                initial_snapshot_delay: Duration::from_millis(initial_delay_ms),
                snapshot_interval: Duration::from_millis(poll_interval_ms),
                session_stop_interval: Duration::from_millis(stop_check_interval_ms),
            };
            sim::run(scenario, timings, cancel_after_ms.map(Duration::from_millis)).await
        }
    }
}

//! Roomkeeper command line.
//!
//! Loads configuration from a TOML file, initializes tracing, and either
//! prints the effective configuration or runs simulated producers against the
//! freshness layer and coordinator, printing final stats as JSON.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomkeeper::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use roomkeeper::simulate::{self, SimulationOptions};
use roomkeeper::AppError;

/// Roomkeeper: cache, rate governance and coordination for chat session data
#[derive(Parser, Debug)]
#[command(name = "roomkeeper", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "roomkeeper=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the effective settings
    CheckConfig,

    /// Run simulated producers and print the resulting stats
    Simulate {
        /// How long to run, in seconds
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,

        /// Number of simulated producers
        #[arg(long, default_value_t = 3)]
        producers: usize,

        /// Rooms per producer
        #[arg(long, default_value_t = 8)]
        rooms: usize,

        /// Fail the primary after this many seconds
        #[arg(long, default_value_t = 10)]
        fail_after_secs: u64,

        /// Restore the failed primary after this many seconds
        #[arg(long, default_value_t = 8)]
        recover_after_secs: u64,

        /// Do not inject a primary failure
        #[arg(long)]
        no_failure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    tracing::info!(path = %args.config, "Loaded configuration");

    match args.command {
        Command::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Simulate {
            duration_secs,
            producers,
            rooms,
            fail_after_secs,
            recover_after_secs,
            no_failure,
        } => {
            let options = SimulationOptions {
                duration: Duration::from_secs(duration_secs),
                producers,
                rooms,
                fail_primary_after: (!no_failure).then(|| Duration::from_secs(fail_after_secs)),
                recover_after: Duration::from_secs(recover_after_secs),
                ..SimulationOptions::default()
            };
            tracing::info!(
                duration_secs,
                producers,
                rooms,
                failure = !no_failure,
                "Starting simulation"
            );

            let report = simulate::run(&config, options, simulate::shutdown_signal()).await?;
            tracing::info!(
                ticks = report.ticks,
                reads = report.reads,
                backend_calls = report.backend_calls,
                efficiency = report.cache_efficiency,
                "Simulation finished"
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

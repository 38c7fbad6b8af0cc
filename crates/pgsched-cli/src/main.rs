//! pgsched CLI
//!
//! Runs a simulated cluster described in a TOML file through the placement
//! group scheduler.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pgsched_core::{LoggingConfig, SimulationConfig};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// pgsched - placement group scheduling simulator
#[derive(Parser, Debug)]
#[command(name = "pgsched")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule every group in the cluster file and report the outcome
    Simulate {
        /// Cluster file
        #[arg(long)]
        config: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a cluster file and print its summary
    Check {
        /// Cluster file
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match &cli.command {
        Commands::Simulate { config, .. } | Commands::Check { config } => config.clone(),
    };
    let config = SimulationConfig::from_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    init_logging(&config.logging, cli.log_level.as_deref())?;
    info!("Starting pgsched v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Simulate { json, .. } => {
            commands::simulate(config, json).await?;
        }
        Commands::Check { .. } => {
            commands::check(&config)?;
        }
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    let level = match level_override
        .unwrap_or(&logging.level)
        .to_lowercase()
        .as_str()
    {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins when set
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(logging.file.is_none())
        .with_target(false);

    if logging.format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

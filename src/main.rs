//! Salesforest CLI
//!
//! Train a sales regression forest chunk by chunk and score it on held-out rows.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use salesforest::config::SAMPLE_CONFIG;
use salesforest::data::parse_timestamp;
use salesforest::{
    build_runtime, init_rayon, predict_one, run, run_validation, CheckpointStore, Config,
};

#[derive(Parser)]
#[command(name = "salesforest")]
#[command(about = "Incrementally train a sales forecasting forest", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of chunks encoded concurrently
    #[arg(long, global = true)]
    pool_width: Option<usize>,

    /// Override the number of rows per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on the source, then validate (default if no command specified)
    Run,

    /// Score the validation set against the stored checkpoint
    Validate,

    /// Predict a single point from the stored checkpoint
    Predict {
        /// Date or date-time, e.g. 2024-07-17
        #[arg(long)]
        date: String,

        #[arg(long)]
        location: String,

        #[arg(long)]
        sku: String,
    },

    /// Print a summary of the stored checkpoint
    Inspect,

    /// Validate configuration
    CheckConfig,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(&cli.config, cli.pool_width, cli.chunk_size)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli.config)?;
        }

        Some(Commands::Predict {
            date,
            location,
            sku,
        }) => {
            predict_command(&cli.config, &date, &location, &sku)?;
        }

        Some(Commands::Inspect) => {
            inspect_command(&cli.config)?;
        }

        Some(Commands::CheckConfig) => {
            check_config_command(&cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(
    config_path: &PathBuf,
    pool_width: Option<usize>,
    chunk_size: Option<usize>,
) -> Result<Config> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    // Apply overrides
    if let Some(w) = pool_width {
        config.training.pool_width = w;
    }
    if let Some(c) = chunk_size {
        config.source.chunk_size = c;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: &PathBuf, pool_width: Option<usize>, chunk_size: Option<usize>) -> Result<()> {
    let config = load_config(config_path, pool_width, chunk_size)?;

    // Initialize Rayon
    init_rayon(config.training.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.training.worker_threads)?;
    let (summary, validation) = runtime.block_on(run(&config))?;

    println!("\n=== Training ===");
    println!("{}", summary);
    println!("\n=== Validation ===");
    println!("{}", validation);

    Ok(())
}

fn validate_command(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path, None, None)?;
    let runtime = build_runtime(config.training.worker_threads)?;
    let validation = runtime.block_on(run_validation(&config))?;
    println!("{}", validation);
    Ok(())
}

fn predict_command(config_path: &PathBuf, date: &str, location: &str, sku: &str) -> Result<()> {
    let config = load_config(config_path, None, None)?;
    let timestamp =
        parse_timestamp(date).ok_or_else(|| anyhow::anyhow!("Invalid date '{}'", date))?;

    let runtime = build_runtime(None)?;
    let checkpoint = runtime.block_on(salesforest::load_checkpoint(&config.checkpoint))?;

    let prediction = predict_one(
        &checkpoint.model,
        &checkpoint.vocabularies,
        timestamp,
        location,
        sku,
    )?;
    println!(
        "{} | {} | {} | prediction: {:.4}",
        timestamp.date(),
        location.trim(),
        sku.trim(),
        prediction
    );
    Ok(())
}

fn inspect_command(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path, None, None)?;
    let runtime = build_runtime(None)?;

    runtime.block_on(async {
        let store = CheckpointStore::open(&config.checkpoint)?;
        match store.describe().await? {
            Some(summary) => println!("{}", summary),
            None => println!("No checkpoint at {}", store.location()),
        }
        Ok(())
    })
}

fn check_config_command(config_path: &PathBuf) -> Result<()> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

//! stagepipe CLI
//!
//! Runs the numeric demo pipeline from a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stagepipe::{build_runtime, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "stagepipe")]
#[command(about = "Run bounded multi-stage pipelines", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "stagepipe.yaml", global = true)]
    config: PathBuf,

    /// Override the worker count of every stage
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run {
        /// Feed the items 1..=N
        #[arg(short = 'n', long, default_value_t = 1000)]
        items: u64,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stagepipe.yaml")]
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
        None => run_command(cli.config, cli.workers, 1000)?,

        Some(Commands::Run { items }) => run_command(cli.config, cli.workers, items)?,

        Some(Commands::Validate) => validate_command(cli.config)?,

        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn load_config(config_path: &PathBuf) -> Result<Config> {
    if config_path.exists() {
        Config::from_file(config_path)
    } else {
        tracing::info!("{} not found, using default configuration", config_path.display());
        Ok(Config::default())
    }
}

fn run_command(config_path: PathBuf, workers: Option<usize>, items: u64) -> Result<()> {
    let mut config = load_config(&config_path)?;

    // Apply overrides
    if let Some(w) = workers {
        for stage in &mut config.pipeline.stages {
            stage.workers = w;
        }
    }

    config.validate()?;

    let runtime = build_runtime(config.runtime.worker_threads)?;
    let report = runtime.block_on(run_pipeline(config, items))?;

    println!("{}", report.summary);
    println!("Sum of outputs: {}", report.total);

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# stagepipe configuration

# === PIPELINE: stages in execution order ===
pipeline:
  # Capacity of the queue feeding the first stage
  input_capacity: 64

  # On cancel: abandon in-flight items, or let started transforms finish
  cancel_policy: abandon   # or finish_in_flight

  stages:
    - name: square
      workers: 4        # concurrent workers for this stage
      capacity: 64      # capacity of this stage's output queue
      transform: square

    - name: even
      workers: 2
      capacity: 64
      # Built-in transforms: identity, square, keep_even,
      # expand:<n>, delay:<ms>, fail_on:<value>
      transform: keep_even

# === FORK-JOIN: summing the outputs ===
fork_join:
  # Number of chunks (null = one per available core)
  chunks: null

# === RUNTIME ===
runtime:
  # Tokio async worker threads (omit = num CPUs)
  # worker_threads: 8

  # Print progress during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save metrics JSON after the run
  # metrics_output_path: "metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

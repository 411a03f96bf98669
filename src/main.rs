//! Command-line entry point: loads a pipeline config, wires up the bus
//! client and orchestrator, and runs until interrupted. This is ambient
//! process plumbing, not a REST/CRUD surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use streaming_etl_pipeline::bus::BusClient;
use streaming_etl_pipeline::config::PipelineConfig;
use streaming_etl_pipeline::orchestrator::Orchestrator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SIEM_ETL_LOG_LEVEL")]
    log_level: String,

    /// Log format (json, pretty)
    #[arg(long, global = true, default_value = "pretty", env = "SIEM_ETL_LOG_FORMAT")]
    log_format: String,

    /// Directory to write daily-rotated log files to, in addition to stdout.
    #[arg(long, global = true, env = "SIEM_ETL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision and run a pipeline until interrupted.
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Load and validate a pipeline config without starting anything.
    Validate {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

/// Returns the file-appender guard; it must stay alive for the process
/// lifetime or buffered log lines are dropped on exit.
fn init_tracing(log_level: &str, log_format: &str, log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "etl-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            if log_format == "json" {
                registry.with(tracing_subscriber::fmt::layer().json()).with(file_layer.json()).init();
            } else {
                registry.with(tracing_subscriber::fmt::layer()).with(file_layer).init();
            }
            Some(guard)
        }
        None => {
            if log_format == "json" {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                registry.with(tracing_subscriber::fmt::layer()).init();
            }
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli.log_level, &cli.log_format, cli.log_dir.as_ref());

    match cli.command {
        Commands::Validate { config } => {
            let config = PipelineConfig::load(&config)?;
            tracing::info!(pipeline_id = %config.pipeline_id, "configuration is valid");
            Ok(())
        }
        Commands::Run { config } => run(config).await,
    }
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = PipelineConfig::load(&config_path)?;
    let pipeline_id = config.pipeline_id.clone();
    tracing::info!(pipeline_id = %pipeline_id, "starting pipeline");

    let bus = Arc::new(BusClient::connect(&config.nats_url).await?);
    let orchestrator = Arc::new(Orchestrator::new(bus));
    orchestrator.provision(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    orchestrator.shutdown(&pipeline_id).await?;

    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use backupd::config::{AppConfig, CliConfig, FileConfig};
use backupd::daemon::Daemon;
use backupd::executor::CommandExecutor;
use backupd::server::{metrics, run_server};

#[derive(Parser, Debug)]
#[clap(version, about = "Runs backup operations on schedules, file changes and API requests")]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// The port the HTTP API listens on.
    #[clap(short, long, default_value_t = 8484)]
    pub port: u16,

    /// How many jobs may run at the same time.
    #[clap(long, default_value_t = 1)]
    pub concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}...", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        port: cli_args.port,
        concurrency: cli_args.concurrency,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    info!(
        "Configured {} backups, concurrency {}",
        config.backups.len(),
        config.jobs.runner.concurrency
    );

    metrics::init_metrics();

    let port = config.port;
    let daemon = Arc::new(Daemon::new(config, Arc::new(CommandExecutor::new()))?);
    daemon.start();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down...");
        signal_token.cancel();
    });

    let served = run_server(daemon.clone(), port, shutdown).await;
    daemon.shutdown();
    served
}

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use swarmd::config::Config;
use swarmd::coordinator::Coordinator;

#[derive(Parser)]
#[command(
    name = "swarmd",
    about = "Local swarm coordinator: supervises LLM CLI agents from a filesystem spool"
)]
struct Cli {
    /// Spool root directory (overrides SWARM_DIR)
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "swarmd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(dir) = cli.dir {
        cfg.swarm_dir = dir;
    }

    let coordinator = Coordinator::start(cfg)
        .await
        .context("coordinator startup failed")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    coordinator.shutdown().await;
    Ok(())
}

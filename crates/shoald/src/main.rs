//! shoald: the Shoal daemon.
//!
//! Single binary that assembles the Shoal subsystems:
//! - State store (redb)
//! - Local process runtime
//! - Command health probes
//! - In-process target group
//! - File-backed autoscaling metrics
//! - One reconciliation worker per service
//!
//! # Usage
//!
//! ```text
//! shoald run --config /etc/shoal/shoald.toml --data-dir /var/lib/shoal
//! shoald check --config /etc/shoal/shoald.toml
//! ```

mod apply;
mod config;
mod local;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use shoal_autoscale::{ManualMetrics, MetricSource};
use shoal_balancer::TargetGroup;
use shoal_controller::{Fleet, FleetParts};
use shoal_health::CommandProbe;
use shoal_state::StateStore;

use crate::config::ShoalConfig;
use crate::local::LocalRuntime;
use crate::metrics::FileMetrics;

#[derive(Parser)]
#[command(name = "shoald", about = "Shoal rolling-deployment daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Path to shoald.toml.
        #[arg(long, default_value = "/etc/shoal/shoald.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/shoal")]
        data_dir: PathBuf,
    },
    /// Validate a config file and print the services it declares.
    Check {
        #[arg(long, default_value = "/etc/shoal/shoald.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
        Command::Check { config } => check(config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,shoald=debug,shoal=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check(path: PathBuf) -> anyhow::Result<()> {
    let config = ShoalConfig::from_file(&path)?;
    let services = config.desired_services()?;
    println!("{}", serde_json::to_string_pretty(&services)?);
    Ok(())
}

async fn run(config_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("Shoal daemon starting");

    let config = ShoalConfig::from_file(&config_path)?;
    let controller = config.controller()?;
    let services = config.desired_services()?;
    info!(path = ?config_path, services = services.len(), "config loaded");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("shoal.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let runtime = Arc::new(LocalRuntime::new(
        config.runtime.host.clone(),
        config.runtime.first_port,
        config.runtime.ports,
    ));
    info!(
        first_port = config.runtime.first_port,
        ports = config.runtime.ports,
        "local runtime initialized"
    );

    let targets = TargetGroup::new("shoald");
    let metrics: Arc<dyn MetricSource> = match &config.controller.metrics_dir {
        Some(dir) => {
            info!(dir = %dir, "file metrics enabled");
            Arc::new(FileMetrics::new(dir))
        }
        None => {
            warn!("no metrics_dir configured; autoscaling will see no metrics");
            Arc::new(ManualMetrics::new())
        }
    };

    let fleet = Fleet::new(
        store,
        FleetParts {
            runtime,
            binding: Arc::new(targets.clone()),
            probe: Arc::new(CommandProbe),
            metrics,
        },
        controller,
    );

    let restored = fleet.restore().await?;
    info!(services = restored, "fleet restored");
    apply::apply_services(&fleet, &services).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    fleet.spawn_workers(shutdown_rx).await;
    info!(services = fleet.list_services().await.len(), "service workers started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install CTRL+C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    fleet.join_workers().await;
    info!(targets = targets.len(), "Shoal daemon stopped");
    Ok(())
}

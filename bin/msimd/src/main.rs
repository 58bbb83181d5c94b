//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the meter simulator daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use msim_channel::LoopbackHub;
use msim_common::config::AppConfig;
use msim_common::logging::init_tracing;
use msim_device::DeviceStatus;
use msim_fleet::{load_commands, replay_commands, Fleet};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("msimd ", env!("CARGO_PKG_VERSION")),
    about = "Smart meter fleet simulator",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the fleet random seed")]
    seed: Option<u64>,

    #[arg(long, value_name = "SECS", help = "Stop after this many seconds instead of waiting for Ctrl-C")]
    duration: Option<u64>,

    #[arg(long, value_name = "FILE", help = "NDJSON command script replayed into the hub")]
    commands: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the fleet")]
    Run,
    #[command(about = "Print the configured device plan without connecting")]
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/fleet.toml"));
    candidates.push(PathBuf::from("configs/fleet.example.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(seed) = cli.seed {
        config.simulation.random_seed = Some(seed);
    }
    init_tracing("msimd", &config.logging)?;
    info!(config_path = %loaded.source.display(), devices = config.devices.len(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, cli.duration, cli.commands).await?,
        Commands::Status => {
            let hub = LoopbackHub::new();
            let fleet = Fleet::from_config(&config, hub.factory());
            render_status(&fleet.status())?;
        }
    }

    Ok(())
}

fn build_hub(config: &AppConfig) -> Arc<LoopbackHub> {
    let hub = LoopbackHub::new();
    let shared_endpoint = config.devices.values().all(|device| device.endpoint.is_none());
    if shared_endpoint {
        hub.set_endpoint(config.endpoint.address.clone());
    }
    for (device_id, device) in &config.devices {
        if let Some(credential) = &device.credential {
            hub.provision(device_id.clone(), credential.clone());
        }
    }
    hub
}

async fn run_daemon(config: AppConfig, duration: Option<u64>, commands: Option<PathBuf>) -> Result<()> {
    let hub = build_hub(&config);
    let handle = Fleet::from_config(&config, hub.factory()).start();

    let replay = match commands {
        Some(path) => {
            let records = load_commands(&path)
                .with_context(|| format!("unable to load command script {}", path.display()))?;
            info!(script = %path.display(), commands = records.len(), "replaying command script");
            let hub = hub.clone();
            Some(tokio::spawn(async move { replay_commands(&hub, records).await }))
        }
        None => None,
    };

    match duration {
        Some(secs) => {
            info!(duration_secs = secs, "fleet running for a fixed duration");
            tokio::select! {
                result = signal::ctrl_c() => {
                    result?;
                    info!("ctrl-c received; shutting down");
                }
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("run duration elapsed; shutting down");
                }
            }
        }
        None => {
            info!("fleet running; waiting for termination signal");
            signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
        }
    }

    if let Some(task) = replay {
        if task.is_finished() {
            match task.await {
                Ok(count) => info!(replayed = count, "command script complete"),
                Err(err) => warn!(error = %err, "command replay task failed"),
            }
        } else {
            task.abort();
            warn!("command script interrupted by shutdown");
        }
    }

    let metrics = handle.metrics();
    let statuses = handle.shutdown().await;
    render_status(&statuses)?;
    info!(metrics = %serde_json::to_string(&metrics)?, "fleet metrics");
    Ok(())
}

fn render_status(statuses: &[DeviceStatus]) -> Result<()> {
    for status in statuses {
        info!(
            device_id = %status.id,
            state = ?status.state,
            installed = status.installed,
            endpoint = status.endpoint.as_deref().unwrap_or("-"),
            temperature_override = ?status.temperature_override,
            "device status"
        );
    }
    println!("{}", serde_json::to_string_pretty(statuses)?);
    Ok(())
}

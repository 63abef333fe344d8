//! ---
//! vfab_section: "01-fleet-runtime"
//! vfab_subsection: "binary"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Binary entrypoint for the V-FAB daemon."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use v_fab_common::{init_tracing, AppConfig};
use v_fab_core::{FleetCollaborators, FleetSupervisor};
use v_fab_net::{
    InMemoryEventChannel, InMemoryQueue, InMemoryShadowHub, LogNotifier, Notifier, WebhookNotifier,
};
use v_fab_sim::{BridgeSettings, PlcSettings, SignalBridge, SimulatedPlc};

#[derive(Debug, Parser)]
#[command(author, version, about = "V-FAB fleet simulator daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the simulation seed")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the fleet")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(seed) = cli.seed {
        config.simulation.seed = seed;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("v-fabd", &config.logging)?;
            info!(config_path = %loaded.source.display(), devices = config.fleet.len(), "configuration loaded");
            run_daemon(config).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!(
                "Configuration OK: {} device(s), poll interval {:?}",
                config.fleet.len(),
                config.poll_interval
            );
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let plc = Arc::new(SimulatedPlc::new(PlcSettings {
        seed: config.simulation.seed,
        fault_rate: config.simulation.fault_rate,
        bad_ratio: config.simulation.bad_ratio,
    }));
    for (device_id, device_cfg) in &config.fleet {
        plc.register_device(device_cfg.node_prefix_or(device_id), device_cfg.initial_rate);
    }

    let hub = Arc::new(InMemoryShadowHub::new());
    let events = Arc::new(InMemoryEventChannel::new());
    let queues = Arc::new(InMemoryQueue::new());
    let notifier: Arc<dyn Notifier> = match &config.notifier.webhook_url {
        Some(url) => {
            info!(endpoint = %url, "webhook notifier enabled");
            Arc::new(WebhookNotifier::new(
                url.as_str(),
                config.notifier.recipient.as_str(),
            ))
        }
        None => Arc::new(LogNotifier::new(config.notifier.recipient.as_str())),
    };

    let bridge = SignalBridge::new(
        queues.clone(),
        BridgeSettings {
            window: config.simulation.bridge_window,
            production_queue: config.escalation.production_queue.clone(),
            error_queue: config.escalation.error_queue.clone(),
        },
    );

    let supervisor = FleetSupervisor::new(
        config,
        FleetCollaborators {
            telemetry: plc.clone(),
            shadow: hub.clone(),
            fleet_shadow: hub.clone(),
            events: events.clone(),
            queues: queues.clone(),
            notifier,
        },
    );
    let handle = supervisor.start().await?;
    let bridge_task = bridge.spawn(events.subscribe(), handle.subscribe_shutdown());

    info!("fleet running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    handle.shutdown().await?;
    if let Err(err) = bridge_task.await {
        warn!(error = %err, "bridge task join error");
    }

    Ok(())
}

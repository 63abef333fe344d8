//! ---
//! vfab_section: "01-fleet-runtime"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Fleet supervision and lifecycle management."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use v_fab_common::AppConfig;
use v_fab_device::{DeviceCollaborators, DeviceReconciler};
use v_fab_escalation::{EscalationEngine, EscalationHandle};
use v_fab_net::{
    EventChannel, FleetShadowClient, Notifier, QueueTransport, ShadowChannel, TelemetrySource,
};

/// The collaborator handles the supervisor distributes at startup.
///
/// Ownership is explicit: every device reconciler receives its own clone of
/// the device-facing handles, the escalation engine receives the fleet-facing
/// ones. No global mutable state.
#[derive(Clone)]
pub struct FleetCollaborators {
    pub telemetry: Arc<dyn TelemetrySource>,
    pub shadow: Arc<dyn ShadowChannel>,
    pub fleet_shadow: Arc<dyn FleetShadowClient>,
    pub events: Arc<dyn EventChannel>,
    pub queues: Arc<dyn QueueTransport>,
    pub notifier: Arc<dyn Notifier>,
}

/// Owns the set of device reconcilers and the escalation engine, providing a
/// single cancellable run lifecycle.
pub struct FleetSupervisor {
    config: Arc<AppConfig>,
    collaborators: FleetCollaborators,
}

impl FleetSupervisor {
    /// Build a supervisor over a validated configuration.
    pub fn new(config: AppConfig, collaborators: FleetCollaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
        }
    }

    /// Start the escalation engine, then one reconciliation task per
    /// configured device, and return a handle for lifecycle control.
    pub async fn start(self) -> Result<FleetHandle> {
        let (shutdown_tx, _) = broadcast::channel(16);

        let engine = Arc::new(EscalationEngine::new(
            self.config.escalation.clone(),
            self.collaborators.queues.clone(),
            self.collaborators.fleet_shadow.clone(),
            self.collaborators.notifier.clone(),
        ));
        let engine_handle = engine
            .start(&shutdown_tx)
            .await
            .context("start escalation engine")?;

        let mut device_tasks = Vec::new();
        for (device_id, device_cfg) in &self.config.fleet {
            let reconciler = DeviceReconciler::new(
                device_id,
                device_cfg.node_prefix_or(device_id),
                device_cfg.initial_rate,
                self.config.escalation.error_queue.clone(),
                DeviceCollaborators {
                    telemetry: self.collaborators.telemetry.clone(),
                    shadow: self.collaborators.shadow.clone(),
                    events: self.collaborators.events.clone(),
                    queues: self.collaborators.queues.clone(),
                },
            );
            let poll_interval = self.config.poll_interval;
            let shutdown_rx = shutdown_tx.subscribe();
            let task_device_id = device_id.clone();
            let task = tokio::spawn(async move {
                // cycle errors are absorbed inside the run loop; anything
                // surfacing here is a startup failure of this device only
                if let Err(err) = reconciler.run(poll_interval, shutdown_rx).await {
                    error!(device = %task_device_id, error = %err, "device task failed");
                }
            });
            device_tasks.push((device_id.clone(), task));
        }

        info!(devices = device_tasks.len(), "fleet supervisor started");
        Ok(FleetHandle {
            shutdown: shutdown_tx,
            device_tasks,
            engine: engine_handle,
        })
    }
}

/// Handle returned from supervisor startup.
pub struct FleetHandle {
    shutdown: broadcast::Sender<()>,
    device_tasks: Vec<(String, JoinHandle<()>)>,
    engine: EscalationHandle,
}

impl FleetHandle {
    /// Subscribe an auxiliary task (e.g. the signal bridge) to the fleet
    /// shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Fan out the shutdown signal, wait for every device task, then stop
    /// the escalation engine.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (device_id, task) in self.device_tasks {
            if let Err(err) = task.await {
                error!(device = %device_id, error = %err, "device task join error");
            }
        }
        self.engine.stop().await;
        info!("fleet supervisor shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;
    use std::time::Duration;
    use v_fab_common::DeviceConfig;
    use v_fab_msg::{node, shadow};
    use v_fab_net::{
        InMemoryEventChannel, InMemoryQueue, InMemoryShadowHub, InMemoryTelemetry, RecordingNotifier,
    };

    fn seed_nodes(telemetry: &InMemoryTelemetry, prefix: &str, rate: i64) {
        telemetry.set_node(node::path(prefix, node::PRODUCTION_STATUS), json!(1));
        telemetry.set_node(node::path(prefix, node::PRODUCTION_RATE), json!(rate));
        telemetry.set_node(node::path(prefix, node::WORKORDER_ID), json!("wo-1"));
        telemetry.set_node(node::path(prefix, node::GOOD_COUNT), json!(10));
        telemetry.set_node(node::path(prefix, node::BAD_COUNT), json!(0));
        telemetry.set_node(node::path(prefix, node::TEMPERATURE), json!(60.0));
        telemetry.set_node(node::path(prefix, node::DEVICE_ERROR), json!(0));
    }

    fn two_device_config() -> AppConfig {
        let mut fleet = IndexMap::new();
        fleet.insert("press-1".to_owned(), DeviceConfig::default());
        fleet.insert("press-2".to_owned(), DeviceConfig::default());
        AppConfig {
            fleet,
            poll_interval: Duration::from_millis(20),
            ..AppConfig::default()
        }
    }

    async fn wait_for_reported(
        hub: &InMemoryShadowHub,
        device_id: &str,
        field: &str,
        expected: serde_json::Value,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(view) = hub.get_reported(device_id).await {
                if view.field(field) == Some(&expected) {
                    return;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {device_id}.{field} == {expected}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn one_failing_device_does_not_stop_the_others() {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        // press-2 has a healthy node tree, press-1 has none at all
        seed_nodes(&telemetry, "press-2", 60);

        let hub = Arc::new(InMemoryShadowHub::new());
        let events = Arc::new(InMemoryEventChannel::new());
        let queues = Arc::new(InMemoryQueue::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let supervisor = FleetSupervisor::new(
            two_device_config(),
            FleetCollaborators {
                telemetry: telemetry.clone(),
                shadow: hub.clone(),
                fleet_shadow: hub.clone(),
                events: events.clone(),
                queues: queues.clone(),
                notifier: notifier.clone(),
            },
        );
        let handle = supervisor.start().await.expect("start");

        wait_for_reported(&hub, "press-2", shadow::PRODUCTION_RATE, json!(60)).await;

        // the failing device still reconciles with fail-safe values
        wait_for_reported(&hub, "press-1", shadow::DEVICE_ERROR, json!("Unknown")).await;

        // and keeps publishing telemetry events built from defaults
        assert!(!events.published_for("press-1").is_empty());
        assert!(!events.published_for("press-2").is_empty());

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_terminates_all_tasks() {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        seed_nodes(&telemetry, "press-1", 60);
        seed_nodes(&telemetry, "press-2", 60);

        let hub = Arc::new(InMemoryShadowHub::new());
        let supervisor = FleetSupervisor::new(
            two_device_config(),
            FleetCollaborators {
                telemetry,
                shadow: hub.clone(),
                fleet_shadow: hub,
                events: Arc::new(InMemoryEventChannel::new()),
                queues: Arc::new(InMemoryQueue::new()),
                notifier: Arc::new(RecordingNotifier::new()),
            },
        );
        let handle = supervisor.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown().await.expect("shutdown");
    }
}

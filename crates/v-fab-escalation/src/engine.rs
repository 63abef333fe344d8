//! ---
//! vfab_section: "04-escalation-policy"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Queue-driven escalation engine."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use v_fab_common::EscalationSettings;
use v_fab_msg::{command, shadow, ErrorSignal, ProductionSignal, QueueSignal};
use v_fab_net::{
    FleetShadowClient, NetError, Notifier, QueueMessage, QueueTransport, ShadowFields, ShadowView,
};

/// Fleet-wide escalation engine.
///
/// Consumes production-quality and error-count signals from two queues and
/// turns sustained bad conditions into corrective actions: a version-guarded
/// desired-rate decrease, or an emergency-stop command with a best-effort
/// notification. Actions are designed to be idempotent under the at-least-
/// once delivery of the queue transport.
pub struct EscalationEngine {
    settings: EscalationSettings,
    queues: Arc<dyn QueueTransport>,
    fleet: Arc<dyn FleetShadowClient>,
    notifier: Arc<dyn Notifier>,
}

/// Handle over the engine's consumer tasks.
pub struct EscalationHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl EscalationHandle {
    /// Wait for the consumer tasks to finish. Consumption itself stops when
    /// the shutdown signal passed to [`EscalationEngine::start`] fires;
    /// in-flight message handling is allowed to complete.
    pub async fn stop(self) {
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "escalation consumer join error");
            }
        }
        info!("escalation engine stopped");
    }
}

impl EscalationEngine {
    /// Build an engine over the given collaborators.
    pub fn new(
        settings: EscalationSettings,
        queues: Arc<dyn QueueTransport>,
        fleet: Arc<dyn FleetShadowClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            queues,
            fleet,
            notifier,
        }
    }

    /// Purge both source queues, then start one consumer task per queue.
    ///
    /// The purge is a deliberate reset-on-restart policy: signals queued
    /// before a restart describe conditions the fleet may already have acted
    /// on, so they are drained and acknowledged without being processed.
    pub async fn start(
        self: Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<EscalationHandle> {
        for queue in [
            self.settings.production_queue.clone(),
            self.settings.error_queue.clone(),
        ] {
            let drained = self
                .queues
                .purge(&queue)
                .await
                .with_context(|| format!("purge queue {queue} at startup"))?;
            if drained > 0 {
                info!(queue, drained, "purged stale signals at startup");
            }
        }

        let mut tasks = Vec::new();
        for queue in [
            self.settings.production_queue.clone(),
            self.settings.error_queue.clone(),
        ] {
            let engine = self.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                engine.consume(queue, &mut shutdown_rx).await;
            }));
        }
        info!("escalation engine started");
        Ok(EscalationHandle { tasks })
    }

    async fn consume(&self, queue: String, shutdown: &mut broadcast::Receiver<()>) {
        debug!(queue, "escalation consumer started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(queue, "escalation consumer shutdown");
                    break;
                }
                received = self.queues.receive(&queue) => match received {
                    Ok(message) => self.handle_message(&queue, message).await,
                    Err(err) => {
                        warn!(queue, error = %err, "queue receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Decode and process one message, acknowledging it afterwards.
    ///
    /// Handler failures are caught and logged and the message is still
    /// acknowledged; only a deserialization failure leaves the message
    /// unacknowledged, keeping malformed input visible to the transport
    /// without creating a poison-message loop.
    async fn handle_message(&self, queue: &str, message: QueueMessage) {
        let signal = match QueueSignal::decode(queue, &message.body) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(queue, id = %message.id, error = %err, "malformed queue message left unacknowledged");
                return;
            }
        };

        match &signal {
            QueueSignal::Production(signal) => self.on_production_signal(signal).await,
            QueueSignal::Error(signal) => self.on_error_signal(signal).await,
        }

        if let Err(err) = self.queues.ack(&message).await {
            warn!(queue, id = %message.id, error = %err, "ack failed; transport may redeliver");
        }
    }

    /// React to a production-quality signal.
    pub async fn on_production_signal(&self, signal: &ProductionSignal) {
        if signal.percent_good_production >= self.settings.quality_threshold {
            return;
        }
        info!(
            device = %signal.device_id,
            percent = signal.percent_good_production,
            threshold = self.settings.quality_threshold,
            "production quality below threshold"
        );
        if let Err(err) = self.decrease_production_rate(&signal.device_id).await {
            warn!(device = %signal.device_id, error = %err, "production throttle failed");
        }
    }

    /// React to an accumulated error-count signal.
    pub async fn on_error_signal(&self, signal: &ErrorSignal) {
        if signal.error_count <= self.settings.error_threshold {
            return;
        }
        warn!(
            device = %signal.device_id,
            count = signal.error_count,
            threshold = self.settings.error_threshold,
            "error count above threshold"
        );
        if let Err(err) = self.trigger_emergency_stop(&signal.device_id).await {
            warn!(device = %signal.device_id, error = %err, "emergency stop failed");
        }
    }

    /// Decrease a device's desired production rate by one step, guarded by
    /// the shadow version token. Stopped devices and devices at the rate
    /// floor are left alone.
    async fn decrease_production_rate(&self, device_id: &str) -> Result<()> {
        let view = self
            .fleet
            .get_reported(device_id)
            .await
            .context("read reported state")?;

        if is_emergency_stopped(&view) {
            debug!(device = device_id, "device already emergency-stopped; skipping throttle");
            return Ok(());
        }
        let Some(rate) = view.field(shadow::PRODUCTION_RATE).and_then(Value::as_i64) else {
            warn!(device = device_id, "no reported production rate; skipping throttle");
            return Ok(());
        };
        if rate < self.settings.rate_floor {
            debug!(device = device_id, rate, "rate below floor; skipping throttle");
            return Ok(());
        }

        let target = (rate - self.settings.rate_step).max(0);
        let mut patch = ShadowFields::new();
        patch.insert(shadow::PRODUCTION_RATE.to_owned(), json!(target));
        match self.fleet.patch_desired(device_id, patch, view.version).await {
            Ok(()) => {
                info!(device = device_id, from = rate, to = target, "desired production rate decreased");
                Ok(())
            }
            Err(NetError::Conflict { expected, current }) => {
                info!(
                    device = device_id,
                    expected, current, "shadow version stale; throttle skipped this cycle"
                );
                Ok(())
            }
            Err(err) => Err(err).context("desired rate write"),
        }
    }

    /// Invoke the emergency stop on a device, notify the configured
    /// recipient, and drain queued error signals from the same burst.
    /// Devices whose reported state already shows an emergency stop are
    /// skipped to keep the action idempotent under redelivery.
    async fn trigger_emergency_stop(&self, device_id: &str) -> Result<()> {
        match self.fleet.get_reported(device_id).await {
            Ok(view) if is_emergency_stopped(&view) => {
                info!(device = device_id, "device already emergency-stopped; skipping");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                debug!(device = device_id, error = %err, "reported state unavailable before stop");
            }
        }

        let response = self
            .fleet
            .invoke_command(
                device_id,
                command::EMERGENCY_STOP,
                Value::Null,
                self.settings.command_timeout,
            )
            .await
            .context("invoke emergency stop")?;
        info!(device = device_id, status = response.status, "emergency stop invoked");

        let reason =
            format!("Emergency stop triggered for device {device_id} after sustained errors.");
        if let Err(err) = self.notifier.notify(device_id, &reason).await {
            warn!(device = device_id, error = %err, "notification delivery failed");
        }

        match self.queues.purge(&self.settings.error_queue).await {
            Ok(drained) => {
                info!(device = device_id, drained, "error queue purged after emergency stop");
            }
            Err(err) => {
                warn!(device = device_id, error = %err, "error queue purge failed");
            }
        }
        Ok(())
    }
}

fn is_emergency_stopped(view: &ShadowView) -> bool {
    view.field(shadow::DEVICE_ERROR)
        .and_then(Value::as_str)
        .map(|rendering| rendering.split(',').any(|name| name == "EmergencyStop"))
        .unwrap_or(false)
}

//! ---
//! vfab_section: "03-device-reconciler"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Per-device poll/report/react reconciliation loop."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use v_fab_msg::{command, node, shadow, DeviceErrorFlags, ErrorEvent, TelemetrySample};
use v_fab_net::{
    CommandRequest, CommandResponse, EventChannel, QueueTransport, ShadowChannel, ShadowFields,
    TelemetrySource,
};

use crate::state::DeviceShadowState;

/// External collaborators a reconciler acts through. Each reconciler owns its
/// own handle set; nothing here is shared mutable state.
#[derive(Clone)]
pub struct DeviceCollaborators {
    /// Process-variable transport of the device's controller.
    pub telemetry: Arc<dyn TelemetrySource>,
    /// Device-side shadow channel.
    pub shadow: Arc<dyn ShadowChannel>,
    /// Fire-and-forget event channel.
    pub events: Arc<dyn EventChannel>,
    /// Queue transport, used only to drain stale error signals on reset.
    pub queues: Arc<dyn QueueTransport>,
}

/// One device's continuous poll → report → react cycle.
pub struct DeviceReconciler {
    device_id: String,
    node_prefix: String,
    error_queue: String,
    telemetry: Arc<dyn TelemetrySource>,
    shadow: Arc<dyn ShadowChannel>,
    events: Arc<dyn EventChannel>,
    queues: Arc<dyn QueueTransport>,
    state: DeviceShadowState,
}

impl DeviceReconciler {
    /// Build a reconciler for one device.
    pub fn new(
        device_id: impl Into<String>,
        node_prefix: impl Into<String>,
        initial_rate: i64,
        error_queue: impl Into<String>,
        collaborators: DeviceCollaborators,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            node_prefix: node_prefix.into(),
            error_queue: error_queue.into(),
            telemetry: collaborators.telemetry,
            shadow: collaborators.shadow,
            events: collaborators.events,
            queues: collaborators.queues,
            state: DeviceShadowState::new(initial_rate),
        }
    }

    /// The device this reconciler owns.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current in-memory shadow state, for inspection.
    pub fn state(&self) -> &DeviceShadowState {
        &self.state
    }

    /// Run the reconciliation loop until the shutdown signal fires.
    ///
    /// Registers the desired-property and command streams once at startup,
    /// writes the boot announcement, then loops `reconcile_cycle` on the
    /// fixed poll interval. Cycle failures are logged, never fatal.
    pub async fn run(
        mut self,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut desired = self
            .shadow
            .desired_changes(&self.device_id)
            .await
            .with_context(|| format!("subscribe desired changes for {}", self.device_id))?;
        let mut commands = self
            .shadow
            .commands(&self.device_id)
            .await
            .with_context(|| format!("subscribe commands for {}", self.device_id))?;

        self.announce_boot().await;

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(device = %self.device_id, "device reconciler started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(device = %self.device_id, "shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile_cycle().await {
                        error!(device = %self.device_id, error = %err, "reconcile cycle failed");
                    }
                }
                Some(patch) = desired.recv() => self.on_desired_changed(patch).await,
                Some(request) = commands.recv() => self.on_command(request).await,
            }
        }
        info!(device = %self.device_id, "device reconciler stopped");
        Ok(())
    }

    /// One poll → report → react cycle, in strict order: telemetry publish,
    /// error-edge evaluation, rate read, shadow reconciliation.
    pub async fn reconcile_cycle(&mut self) -> Result<()> {
        let sample = self.read_telemetry().await;
        let payload = serde_json::to_value(&sample).context("serialize telemetry sample")?;
        if let Err(err) = self.events.publish(&self.device_id, payload).await {
            warn!(device = %self.device_id, error = %err, "telemetry event publish failed");
        }

        let flags = self.read_error_flags().await;
        let count = flags.active_count();
        if count > self.state.last_error_count {
            let newly = flags.newly_active(self.state.error_flags);
            info!(device = %self.device_id, errors = %flags, count, "device error count rose");
            let event = ErrorEvent::rising(newly, count);
            let payload = serde_json::to_value(&event).context("serialize error event")?;
            if let Err(err) = self.events.publish(&self.device_id, payload).await {
                warn!(device = %self.device_id, error = %err, "error event publish failed");
            }
        }
        self.state.error_flags = flags;
        self.state.last_error_count = count;

        self.state.production_rate = self.read_production_rate().await;

        self.reconcile_shadow().await;
        Ok(())
    }

    /// Read the five telemetry fields. Each failed read falls back to its
    /// documented zero/empty default; telemetry must never crash the loop.
    pub async fn read_telemetry(&self) -> TelemetrySample {
        let production_status = self.read_i64_field(node::PRODUCTION_STATUS, 0).await;
        let workorder_id = self.read_string_field(node::WORKORDER_ID).await;
        let good_count = self.read_i64_field(node::GOOD_COUNT, 0).await;
        let bad_count = self.read_i64_field(node::BAD_COUNT, 0).await;
        let temperature = self.read_f64_field(node::TEMPERATURE).await;
        TelemetrySample::new(
            production_status,
            workorder_id,
            good_count,
            bad_count,
            temperature,
        )
    }

    /// Read the raw error register. Failure reads as `Unknown`: an
    /// over-reported error is preferable to silence.
    pub async fn read_error_flags(&self) -> DeviceErrorFlags {
        let path = node::path(&self.node_prefix, node::DEVICE_ERROR);
        match self.telemetry.read_node(&path).await {
            Ok(value) => match value.as_i64() {
                Some(raw) => DeviceErrorFlags::from_raw(raw),
                None => {
                    warn!(device = %self.device_id, "error register is not an integer");
                    DeviceErrorFlags::UNKNOWN
                }
            },
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "error register read failed");
                DeviceErrorFlags::UNKNOWN
            }
        }
    }

    /// Read the production rate, keeping the previously reported value on
    /// failure: stale-but-valid over undefined.
    pub async fn read_production_rate(&self) -> i64 {
        let fallback = self
            .state
            .last_reported_rate
            .unwrap_or(self.state.production_rate);
        let path = node::path(&self.node_prefix, node::PRODUCTION_RATE);
        match self.telemetry.read_node(&path).await {
            Ok(value) => value.as_i64().unwrap_or(fallback),
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "production rate read failed; keeping previous value");
                fallback
            }
        }
    }

    /// Apply a desired-property patch. The only recognized field is the
    /// production rate; anything else is ignored.
    pub async fn on_desired_changed(&mut self, patch: ShadowFields) {
        for (field, value) in &patch {
            match field.as_str() {
                shadow::PRODUCTION_RATE => {
                    let Some(rate) = value.as_i64() else {
                        warn!(device = %self.device_id, "desired production rate is not an integer");
                        continue;
                    };
                    let path = node::path(&self.node_prefix, node::PRODUCTION_RATE);
                    if let Err(err) = self.telemetry.write_node(&path, json!(rate)).await {
                        warn!(device = %self.device_id, error = %err, "failed to apply desired production rate");
                        continue;
                    }
                    self.state.production_rate = rate;
                    self.state.last_reported_rate = Some(rate);
                    self.mirror_reported_rate(rate).await;
                    info!(device = %self.device_id, rate, "desired production rate applied");
                }
                other => {
                    debug!(device = %self.device_id, field = other, "ignoring unrecognized desired property");
                }
            }
        }
    }

    /// Handle an inbound command through the dispatch table and respond.
    pub async fn on_command(&mut self, request: CommandRequest) {
        let name = request.name.clone();
        let response = match name.as_str() {
            command::EMERGENCY_STOP => self.handle_emergency_stop().await,
            command::RESET_ERROR_STATUS => self.handle_reset_error_status().await,
            other => {
                debug!(device = %self.device_id, command = other, "acknowledging unhandled command");
                CommandResponse::ok("acknowledged")
            }
        };
        info!(device = %self.device_id, command = %name, status = response.status, "command handled");
        request.respond(response);
    }

    async fn handle_emergency_stop(&mut self) -> CommandResponse {
        let method = node::path(&self.node_prefix, command::EMERGENCY_STOP);
        match self.telemetry.call_method(&self.node_prefix, &method).await {
            Ok(_) => CommandResponse::ok("emergency stop engaged"),
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "emergency stop invocation failed");
                CommandResponse::failed(500, format!("emergency stop failed: {err}"))
            }
        }
    }

    async fn handle_reset_error_status(&mut self) -> CommandResponse {
        let method = node::path(&self.node_prefix, command::RESET_ERROR_STATUS);
        if let Err(err) = self.telemetry.call_method(&self.node_prefix, &method).await {
            warn!(device = %self.device_id, error = %err, "error reset invocation failed");
            return CommandResponse::failed(500, format!("error reset failed: {err}"));
        }

        // force-clear the register in case the controller lags the method
        let error_path = node::path(&self.node_prefix, node::DEVICE_ERROR);
        if let Err(err) = self.telemetry.write_node(&error_path, json!(0)).await {
            warn!(device = %self.device_id, error = %err, "error register clear failed");
        }

        self.state.error_flags = DeviceErrorFlags::empty();
        self.state.last_error_count = 0;

        let mut patch = ShadowFields::new();
        patch.insert(
            shadow::DEVICE_ERROR.to_owned(),
            json!(DeviceErrorFlags::empty().render()),
        );
        match self.shadow.patch_reported(&self.device_id, patch).await {
            Ok(()) => self.state.last_reported_flags = Some(DeviceErrorFlags::empty()),
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "cleared error state not reported; retrying next cycle");
                self.state.last_reported_flags = None;
            }
        }

        match self.queues.purge(&self.error_queue).await {
            Ok(drained) => {
                info!(device = %self.device_id, drained, "error queue drained after reset");
            }
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "error queue drain failed");
            }
        }

        CommandResponse::ok("error status reset")
    }

    async fn reconcile_shadow(&mut self) {
        let mut patch = ShadowFields::new();
        if self.state.rate_changed() {
            patch.insert(
                shadow::PRODUCTION_RATE.to_owned(),
                json!(self.state.production_rate),
            );
        }
        if self.state.flags_changed() {
            patch.insert(
                shadow::DEVICE_ERROR.to_owned(),
                json!(self.state.error_flags.render()),
            );
        }
        if patch.is_empty() {
            return;
        }
        match self.shadow.patch_reported(&self.device_id, patch).await {
            Ok(()) => {
                debug!(
                    device = %self.device_id,
                    rate = self.state.production_rate,
                    errors = %self.state.error_flags,
                    "reported state updated"
                );
                self.state.mark_reported();
            }
            Err(err) => {
                warn!(device = %self.device_id, error = %err, "reported patch failed; retrying next cycle");
            }
        }
    }

    async fn mirror_reported_rate(&mut self, rate: i64) {
        let mut patch = ShadowFields::new();
        patch.insert(shadow::PRODUCTION_RATE.to_owned(), json!(rate));
        if let Err(err) = self.shadow.patch_reported(&self.device_id, patch).await {
            warn!(device = %self.device_id, error = %err, "rate mirror failed; retrying next cycle");
            self.state.last_reported_rate = None;
        }
    }

    async fn announce_boot(&self) {
        let mut patch = ShadowFields::new();
        patch.insert(
            shadow::LAST_APP_LAUNCH.to_owned(),
            json!(Utc::now().to_rfc3339()),
        );
        if let Err(err) = self.shadow.patch_reported(&self.device_id, patch).await {
            warn!(device = %self.device_id, error = %err, "boot announcement failed");
        }
    }

    async fn read_i64_field(&self, field: &str, default: i64) -> i64 {
        let path = node::path(&self.node_prefix, field);
        match self.telemetry.read_node(&path).await {
            Ok(value) => value.as_i64().unwrap_or(default),
            Err(err) => {
                warn!(device = %self.device_id, field, error = %err, "telemetry read failed; using default");
                default
            }
        }
    }

    async fn read_string_field(&self, field: &str) -> String {
        let path = node::path(&self.node_prefix, field);
        match self.telemetry.read_node(&path).await {
            Ok(value) => value.as_str().unwrap_or_default().to_owned(),
            Err(err) => {
                warn!(device = %self.device_id, field, error = %err, "telemetry read failed; using default");
                String::new()
            }
        }
    }

    async fn read_f64_field(&self, field: &str) -> f64 {
        let path = node::path(&self.node_prefix, field);
        match self.telemetry.read_node(&path).await {
            Ok(value) => value.as_f64().unwrap_or_default(),
            Err(err) => {
                warn!(device = %self.device_id, field, error = %err, "telemetry read failed; using default");
                0.0
            }
        }
    }
}

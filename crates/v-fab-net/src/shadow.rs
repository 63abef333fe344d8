//! ---
//! vfab_section: "05-edge-interfaces"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Collaborator contracts and in-memory backends."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{NetError, Result};

/// Flat field map carried by shadow patches and documents.
pub type ShadowFields = serde_json::Map<String, Value>;

/// Snapshot of a device's reported record together with its version token.
#[derive(Debug, Clone)]
pub struct ShadowView {
    /// Reported fields.
    pub fields: ShadowFields,
    /// Version token for optimistic-concurrency desired writes.
    pub version: u64,
}

impl ShadowView {
    /// Convenience accessor for a reported field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Response returned to a command invoker.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// HTTP-style status code; 200 on success.
    pub status: u16,
    /// Small JSON payload with a human-readable status string.
    pub payload: Value,
}

impl CommandResponse {
    /// Successful response with the given status message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: 200,
            payload: json!({ "message": message.into() }),
        }
    }

    /// Failed response with an explicit status code.
    pub fn failed(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: json!({ "message": message.into() }),
        }
    }
}

/// An inbound command delivered to a device, carrying its reply handle.
#[derive(Debug)]
pub struct CommandRequest {
    /// Command name.
    pub name: String,
    /// Command payload; `null` when the invoker sent none.
    pub payload: Value,
    reply: Option<oneshot::Sender<CommandResponse>>,
}

impl CommandRequest {
    /// Build a request outside a shadow hub, returning the reply side with
    /// it. Used by unit tests driving a handler directly.
    pub fn direct(
        name: impl Into<String>,
        payload: Value,
    ) -> (Self, oneshot::Receiver<CommandResponse>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                payload,
                reply: Some(reply_tx),
            },
            reply_rx,
        )
    }

    /// Send the response back to the invoker. Dropping the request without
    /// responding surfaces as a channel-closed error on the invoker side.
    pub fn respond(mut self, response: CommandResponse) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(response);
        }
    }
}

/// Device-side shadow operations: reported patches and the inbound streams a
/// reconciler subscribes to at startup.
#[async_trait]
pub trait ShadowChannel: Send + Sync {
    /// Merge fields into the device's reported record.
    async fn patch_reported(&self, device_id: &str, fields: ShadowFields) -> Result<()>;

    /// Stream of desired-property patches for the device. Handed out once.
    async fn desired_changes(&self, device_id: &str)
        -> Result<mpsc::UnboundedReceiver<ShadowFields>>;

    /// Stream of inbound command requests for the device. Handed out once.
    async fn commands(&self, device_id: &str) -> Result<mpsc::UnboundedReceiver<CommandRequest>>;
}

/// Service-side shadow operations used by the escalation engine.
#[async_trait]
pub trait FleetShadowClient: Send + Sync {
    /// Read a device's reported record and version token.
    async fn get_reported(&self, device_id: &str) -> Result<ShadowView>;

    /// Merge fields into the desired record, guarded by the version token
    /// obtained from [`FleetShadowClient::get_reported`]. A stale token is
    /// rejected with [`NetError::Conflict`].
    async fn patch_desired(
        &self,
        device_id: &str,
        fields: ShadowFields,
        expected_version: u64,
    ) -> Result<()>;

    /// Invoke a named command on a device with a bounded response timeout.
    async fn invoke_command(
        &self,
        device_id: &str,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandResponse>;
}

struct DeviceEntry {
    reported: ShadowFields,
    desired: ShadowFields,
    version: u64,
    desired_tx: mpsc::UnboundedSender<ShadowFields>,
    desired_rx: Option<mpsc::UnboundedReceiver<ShadowFields>>,
    command_tx: mpsc::UnboundedSender<CommandRequest>,
    command_rx: Option<mpsc::UnboundedReceiver<CommandRequest>>,
}

impl DeviceEntry {
    fn new() -> Self {
        let (desired_tx, desired_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            reported: ShadowFields::new(),
            desired: ShadowFields::new(),
            version: 0,
            desired_tx,
            desired_rx: Some(desired_rx),
            command_tx,
            command_rx: Some(command_rx),
        }
    }
}

/// In-process shadow hub holding one versioned twin document per device and
/// routing desired patches and command invocations to the owning reconciler.
///
/// Device-side calls create the device record on first use; service-side
/// calls against a device that never connected fail with `UnknownDevice`.
#[derive(Default)]
pub struct InMemoryShadowHub {
    devices: Mutex<HashMap<String, DeviceEntry>>,
}

impl InMemoryShadowHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current desired record of a device, for inspection in tests.
    pub fn desired(&self, device_id: &str) -> Option<ShadowFields> {
        self.devices
            .lock()
            .get(device_id)
            .map(|entry| entry.desired.clone())
    }
}

#[async_trait]
impl ShadowChannel for InMemoryShadowHub {
    async fn patch_reported(&self, device_id: &str, fields: ShadowFields) -> Result<()> {
        let mut devices = self.devices.lock();
        let entry = devices
            .entry(device_id.to_owned())
            .or_insert_with(DeviceEntry::new);
        for (name, value) in fields {
            entry.reported.insert(name, value);
        }
        entry.version += 1;
        Ok(())
    }

    async fn desired_changes(
        &self,
        device_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ShadowFields>> {
        let mut devices = self.devices.lock();
        let entry = devices
            .entry(device_id.to_owned())
            .or_insert_with(DeviceEntry::new);
        entry
            .desired_rx
            .take()
            .ok_or_else(|| NetError::AlreadySubscribed(device_id.to_owned()))
    }

    async fn commands(&self, device_id: &str) -> Result<mpsc::UnboundedReceiver<CommandRequest>> {
        let mut devices = self.devices.lock();
        let entry = devices
            .entry(device_id.to_owned())
            .or_insert_with(DeviceEntry::new);
        entry
            .command_rx
            .take()
            .ok_or_else(|| NetError::AlreadySubscribed(device_id.to_owned()))
    }
}

#[async_trait]
impl FleetShadowClient for InMemoryShadowHub {
    async fn get_reported(&self, device_id: &str) -> Result<ShadowView> {
        let devices = self.devices.lock();
        let entry = devices
            .get(device_id)
            .ok_or_else(|| NetError::UnknownDevice(device_id.to_owned()))?;
        Ok(ShadowView {
            fields: entry.reported.clone(),
            version: entry.version,
        })
    }

    async fn patch_desired(
        &self,
        device_id: &str,
        fields: ShadowFields,
        expected_version: u64,
    ) -> Result<()> {
        let desired_tx = {
            let mut devices = self.devices.lock();
            let entry = devices
                .get_mut(device_id)
                .ok_or_else(|| NetError::UnknownDevice(device_id.to_owned()))?;
            if entry.version != expected_version {
                return Err(NetError::Conflict {
                    expected: expected_version,
                    current: entry.version,
                });
            }
            for (name, value) in fields.clone() {
                entry.desired.insert(name, value);
            }
            entry.version += 1;
            entry.desired_tx.clone()
        };
        if desired_tx.send(fields).is_err() {
            debug!(device = device_id, "desired patch stored but no reconciler is listening");
        }
        Ok(())
    }

    async fn invoke_command(
        &self,
        device_id: &str,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommandRequest {
            name: name.to_owned(),
            payload,
            reply: Some(reply_tx),
        };
        let command_tx = {
            let devices = self.devices.lock();
            let entry = devices
                .get(device_id)
                .ok_or_else(|| NetError::UnknownDevice(device_id.to_owned()))?;
            entry.command_tx.clone()
        };
        command_tx.send(request).map_err(|_| NetError::Closed)?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> ShadowFields {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn reported_patches_bump_the_version() {
        let hub = InMemoryShadowHub::new();
        hub.patch_reported("press-1", fields(&[("ProductionRate", json!(60))]))
            .await
            .expect("patch");
        hub.patch_reported("press-1", fields(&[("DeviceError", json!("None"))]))
            .await
            .expect("patch");

        let view = hub.get_reported("press-1").await.expect("view");
        assert_eq!(view.version, 2);
        assert_eq!(view.field("ProductionRate"), Some(&json!(60)));
        assert_eq!(view.field("DeviceError"), Some(&json!("None")));
    }

    #[tokio::test]
    async fn stale_version_token_is_rejected() {
        let hub = InMemoryShadowHub::new();
        hub.patch_reported("press-1", fields(&[("ProductionRate", json!(60))]))
            .await
            .expect("patch");
        let view = hub.get_reported("press-1").await.expect("view");

        // concurrent reported write invalidates the token
        hub.patch_reported("press-1", fields(&[("DeviceError", json!("None"))]))
            .await
            .expect("patch");

        let err = hub
            .patch_desired(
                "press-1",
                fields(&[("ProductionRate", json!(50))]),
                view.version,
            )
            .await
            .expect_err("stale token");
        assert!(matches!(err, NetError::Conflict { .. }));
        assert!(hub.desired("press-1").expect("entry").is_empty());
    }

    #[tokio::test]
    async fn desired_patch_reaches_the_subscriber() {
        let hub = InMemoryShadowHub::new();
        let mut stream = hub.desired_changes("press-1").await.expect("subscribe");
        let view_version = 0;
        hub.patch_desired(
            "press-1",
            fields(&[("ProductionRate", json!(40))]),
            view_version,
        )
        .await
        .expect("desired patch");

        let patch = stream.recv().await.expect("patch delivered");
        assert_eq!(patch.get("ProductionRate"), Some(&json!(40)));
    }

    #[tokio::test]
    async fn desired_stream_is_handed_out_once() {
        let hub = InMemoryShadowHub::new();
        let _stream = hub.desired_changes("press-1").await.expect("first");
        let err = hub.desired_changes("press-1").await.expect_err("second");
        assert!(matches!(err, NetError::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn command_invocation_round_trips() {
        let hub = std::sync::Arc::new(InMemoryShadowHub::new());
        let mut commands = hub.commands("press-1").await.expect("subscribe");

        let responder = tokio::spawn(async move {
            let request = commands.recv().await.expect("command");
            assert_eq!(request.name, "EmergencyStop");
            request.respond(CommandResponse::ok("emergency stop engaged"));
        });

        let response = hub
            .invoke_command(
                "press-1",
                "EmergencyStop",
                Value::Null,
                Duration::from_secs(1),
            )
            .await
            .expect("response");
        assert_eq!(response.status, 200);
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn command_against_unknown_device_fails() {
        let hub = InMemoryShadowHub::new();
        let err = hub
            .invoke_command("ghost", "EmergencyStop", Value::Null, Duration::from_millis(50))
            .await
            .expect_err("unknown device");
        assert!(matches!(err, NetError::UnknownDevice(_)));
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let hub = InMemoryShadowHub::new();
        // subscribing creates the device but nobody drains the stream
        let _commands = hub.commands("press-1").await.expect("subscribe");
        let err = hub
            .invoke_command(
                "press-1",
                "EmergencyStop",
                Value::Null,
                Duration::from_millis(20),
            )
            .await
            .expect_err("timeout");
        assert!(matches!(err, NetError::Timeout(_)));
    }
}

//! ---
//! vfab_section: "05-edge-interfaces"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Collaborator contracts and in-memory backends."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use crate::{NetError, Result};

/// Best-effort delivery of human-readable fleet alerts.
///
/// Callers must treat failures as non-fatal: log and continue.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert concerning a device.
    async fn notify(&self, device_id: &str, reason: &str) -> Result<()>;
}

/// Notifier that renders alerts into the structured log stream.
pub struct LogNotifier {
    recipient: String,
}

impl LogNotifier {
    /// Create a notifier addressed to the configured recipient.
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, device_id: &str, reason: &str) -> Result<()> {
        info!(
            recipient = %self.recipient,
            device = device_id,
            reason,
            "fleet notification"
        );
        Ok(())
    }
}

/// Notifier that posts alerts as JSON to an HTTP endpoint (e-mail gateway or
/// chat hook).
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
    recipient: String,
}

impl WebhookNotifier {
    /// Create a notifier posting to `endpoint` on behalf of `recipient`.
    pub fn new(endpoint: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, device_id: &str, reason: &str) -> Result<()> {
        let body = json!({
            "recipient": self.recipient,
            "subject": format!("Device alert - {device_id}"),
            "body": reason,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| NetError::Notify(err.to_string()))?;
        response
            .error_for_status()
            .map_err(|err| NetError::Notify(err.to_string()))?;
        Ok(())
    }
}

/// Notifier that records alerts for test assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(device_id, reason)` pairs delivered so far.
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, device_id: &str, reason: &str) -> Result<()> {
        self.delivered
            .lock()
            .push((device_id.to_owned(), reason.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_notifier_captures_alerts() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify("press-1", "emergency stop triggered")
            .await
            .expect("notify");
        assert_eq!(
            notifier.delivered(),
            vec![("press-1".to_owned(), "emergency stop triggered".to_owned())]
        );
    }

    #[tokio::test]
    async fn log_notifier_is_infallible() {
        let notifier = LogNotifier::new("operations@example.invalid");
        notifier
            .notify("press-1", "production quality degraded")
            .await
            .expect("notify");
    }
}

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
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::Result;

/// Per-device publish channel for fire-and-forget structured events.
///
/// The published body is exactly the payload serialization; delivery is
/// at-most-once from the publisher's perspective.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Publish one event for a device.
    async fn publish(&self, device_id: &str, payload: Value) -> Result<()>;
}

/// One event as observed by the in-memory channel.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Publishing device.
    pub device_id: String,
    /// Event body.
    pub payload: Value,
    /// Publish timestamp.
    pub published_at: DateTime<Utc>,
}

/// In-memory event channel retaining an ordered log of published events and
/// feeding live subscribers (the signal bridge) over a broadcast channel.
pub struct InMemoryEventChannel {
    log: Mutex<Vec<PublishedEvent>>,
    feed: broadcast::Sender<PublishedEvent>,
}

impl InMemoryEventChannel {
    /// Create a channel with a bounded live-subscriber buffer.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            log: Mutex::new(Vec::new()),
            feed,
        }
    }

    /// Subscribe to the live event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.feed.subscribe()
    }

    /// All events published so far, in order.
    pub fn published(&self) -> Vec<PublishedEvent> {
        self.log.lock().clone()
    }

    /// Events published by one device, in order.
    pub fn published_for(&self, device_id: &str) -> Vec<PublishedEvent> {
        self.log
            .lock()
            .iter()
            .filter(|event| event.device_id == device_id)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, device_id: &str, payload: Value) -> Result<()> {
        let event = PublishedEvent {
            device_id: device_id.to_owned(),
            payload,
            published_at: Utc::now(),
        };
        self.log.lock().push(event.clone());
        // fire-and-forget: nobody listening is not an error
        let _ = self.feed.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_appends_to_the_log_and_feeds_subscribers() {
        let channel = InMemoryEventChannel::new();
        let mut feed = channel.subscribe();

        channel
            .publish("press-1", json!({ "Temperature": 61.0 }))
            .await
            .expect("publish");
        channel
            .publish("press-2", json!({ "Temperature": 58.0 }))
            .await
            .expect("publish");

        assert_eq!(channel.published().len(), 2);
        assert_eq!(channel.published_for("press-1").len(), 1);

        let live = feed.recv().await.expect("live event");
        assert_eq!(live.device_id, "press-1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let channel = InMemoryEventChannel::new();
        channel
            .publish("press-1", json!({}))
            .await
            .expect("publish");
        assert_eq!(channel.published().len(), 1);
    }
}

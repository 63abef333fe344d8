//! ---
//! vfab_section: "05-edge-interfaces"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Collaborator contracts and in-memory backends."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
//! Contracts for the external collaborators of the fleet runtime and the
//! in-process backends used by the simulator and the test suites.
//!
//! The core components depend only on the traits defined here; the in-memory
//! implementations keep the whole feedback loop runnable inside one process.

pub mod events;
pub mod notify;
pub mod queue;
pub mod shadow;
pub mod telemetry;

use std::time::Duration;

/// Shared result type for collaborator operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Failure modes of the external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transient transport or I/O failure; safe to retry on a later cycle.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// A process-variable node the source does not expose.
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    /// A device the channel has no record for.
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    /// Optimistic-concurrency rejection of a version-guarded shadow write.
    #[error("shadow version conflict: expected {expected}, current {current}")]
    Conflict {
        /// Version token the writer presented.
        expected: u64,
        /// Version the shadow actually holds.
        current: u64,
    },
    /// A bounded wait elapsed without a response.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// A per-device stream that can only be handed out once.
    #[error("stream for '{0}' already taken")]
    AlreadySubscribed(String),
    /// The peer side of an in-process channel is gone.
    #[error("channel closed")]
    Closed,
    /// Payload serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Best-effort notification delivery failed.
    #[error("notification delivery failed: {0}")]
    Notify(String),
}

pub use events::{EventChannel, InMemoryEventChannel, PublishedEvent};
pub use notify::{LogNotifier, Notifier, RecordingNotifier, WebhookNotifier};
pub use queue::{InMemoryQueue, QueueMessage, QueueTransport};
pub use shadow::{
    CommandRequest, CommandResponse, FleetShadowClient, InMemoryShadowHub, ShadowChannel,
    ShadowFields, ShadowView,
};
pub use telemetry::{InMemoryTelemetry, TelemetrySource};

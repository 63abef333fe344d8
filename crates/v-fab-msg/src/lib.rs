//! ---
//! vfab_section: "02-messaging-data-model"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Telemetry, shadow, and queue-signal data model."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod signals;
pub mod types;

/// Shared result type for data-model operations.
pub type Result<T> = std::result::Result<T, MsgError>;

/// Errors raised while encoding or decoding fleet payloads.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A queue name no signal type is registered for.
    #[error("no signal schema registered for queue '{0}'")]
    UnknownQueue(String),
}

pub use signals::{ErrorSignal, ProductionSignal, QueueSignal, ERROR_QUEUE, PRODUCTION_QUEUE};
pub use types::{command, node, shadow, DeviceErrorFlags, ErrorEvent, TelemetrySample};

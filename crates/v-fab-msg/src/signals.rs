//! ---
//! vfab_section: "02-messaging-data-model"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Telemetry, shadow, and queue-signal data model."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::{MsgError, Result};

/// Queue carrying production-quality KPI signals.
pub const PRODUCTION_QUEUE: &str = "productionkpiqueue";
/// Queue carrying accumulated device-error signals.
pub const ERROR_QUEUE: &str = "deviceerrorsqueue";

/// Production-quality signal for one device over an aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionSignal {
    /// Target device identifier.
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    /// Share of good units in percent, `0.0..=100.0`.
    #[serde(rename = "PercentGoodProduction")]
    pub percent_good_production: f32,
}

/// Accumulated error-count signal for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSignal {
    /// Target device identifier.
    #[serde(rename = "DeviceId")]
    pub device_id: String,
    /// Errors observed within the aggregation window.
    #[serde(rename = "ErrorCount")]
    pub error_count: i64,
}

/// A message consumed from the queue transport, tagged by its source queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueSignal {
    /// Signal from [`PRODUCTION_QUEUE`].
    Production(ProductionSignal),
    /// Signal from [`ERROR_QUEUE`].
    Error(ErrorSignal),
}

impl QueueSignal {
    /// Decode a JSON message body according to the queue it arrived on.
    pub fn decode(queue: &str, body: &[u8]) -> Result<Self> {
        match queue {
            PRODUCTION_QUEUE => Ok(Self::Production(serde_json::from_slice(body)?)),
            ERROR_QUEUE => Ok(Self::Error(serde_json::from_slice(body)?)),
            other => Err(MsgError::UnknownQueue(other.to_owned())),
        }
    }

    /// Serialize the signal into a JSON message body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Self::Production(signal) => serde_json::to_vec(signal)?,
            Self::Error(signal) => serde_json::to_vec(signal)?,
        };
        Ok(body)
    }

    /// The queue this signal belongs on.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Production(_) => PRODUCTION_QUEUE,
            Self::Error(_) => ERROR_QUEUE,
        }
    }

    /// The device the signal targets.
    pub fn device_id(&self) -> &str {
        match self {
            Self::Production(signal) => &signal.device_id,
            Self::Error(signal) => &signal.device_id,
        }
    }
}

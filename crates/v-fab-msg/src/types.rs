//! ---
//! vfab_section: "02-messaging-data-model"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Telemetry, shadow, and queue-signal data model."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Process-variable node names exposed by a device controller.
///
/// Nodes are addressed as `{device_node_prefix}/{field}`.
pub mod node {
    /// Production status: `0` idle, non-zero producing.
    pub const PRODUCTION_STATUS: &str = "ProductionStatus";
    /// Target production rate in percent of nominal throughput.
    pub const PRODUCTION_RATE: &str = "ProductionRate";
    /// Identifier of the workorder currently being produced.
    pub const WORKORDER_ID: &str = "WorkorderId";
    /// Units produced within tolerance since workorder start.
    pub const GOOD_COUNT: &str = "GoodCount";
    /// Units rejected since workorder start.
    pub const BAD_COUNT: &str = "BadCount";
    /// Process temperature in degrees Celsius.
    pub const TEMPERATURE: &str = "Temperature";
    /// Raw device error register, read as an integer bitset.
    pub const DEVICE_ERROR: &str = "DeviceError";

    /// Join a device node prefix and a field into a full node path.
    pub fn path(prefix: &str, field: &str) -> String {
        format!("{prefix}/{field}")
    }
}

/// Command names understood by a device reconciler.
pub mod command {
    /// Engage the controller's emergency stop.
    pub const EMERGENCY_STOP: &str = "EmergencyStop";
    /// Clear the controller's error register and drain stale error signals.
    pub const RESET_ERROR_STATUS: &str = "ResetErrorStatus";
}

/// Field names used in the cloud shadow record.
pub mod shadow {
    /// Reported and desired production rate (integer).
    pub const PRODUCTION_RATE: &str = "ProductionRate";
    /// Reported device error rendering (comma-joined flag names, or `None`).
    pub const DEVICE_ERROR: &str = "DeviceError";
    /// Boot announcement timestamp written once at reconciler startup.
    pub const LAST_APP_LAUNCH: &str = "LastAppLaunch";
}

bitflags! {
    /// Bitset of error conditions reported by a device controller.
    ///
    /// The zero value renders as `None`; comparisons are numeric, string
    /// rendering exists only for external payloads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceErrorFlags: u8 {
        /// Operator or fleet-issued emergency stop is engaged.
        const EMERGENCY_STOP = 0b0000_0001;
        /// Supply power failure detected.
        const POWER_FAILURE = 0b0000_0010;
        /// One or more process sensors are not answering.
        const SENSOR_FAILURE = 0b0000_0100;
        /// Error register could not be read or decoded.
        const UNKNOWN = 0b0000_1000;
    }
}

impl DeviceErrorFlags {
    /// Cast a raw error register value into the bitset, discarding bits
    /// outside the known range.
    pub fn from_raw(raw: i64) -> Self {
        Self::from_bits_truncate(raw as u8)
    }

    /// Number of active error conditions (set bits).
    pub fn active_count(&self) -> u32 {
        self.bits().count_ones()
    }

    /// Flags set in `self` that were not set in `previous`.
    pub fn newly_active(self, previous: Self) -> Self {
        self.difference(previous)
    }

    /// Names of all active flags, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        const TABLE: [(DeviceErrorFlags, &str); 4] = [
            (DeviceErrorFlags::EMERGENCY_STOP, "EmergencyStop"),
            (DeviceErrorFlags::POWER_FAILURE, "PowerFailure"),
            (DeviceErrorFlags::SENSOR_FAILURE, "SensorFailure"),
            (DeviceErrorFlags::UNKNOWN, "Unknown"),
        ];
        TABLE
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// External rendering: comma-joined flag names, or `None` for the zero
    /// bitset.
    pub fn render(&self) -> String {
        if self.is_empty() {
            "None".to_owned()
        } else {
            self.names().join(",")
        }
    }
}

impl fmt::Display for DeviceErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// One poll cycle's worth of process variables, published verbatim as the
/// telemetry event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// `0` idle, non-zero producing.
    #[serde(rename = "ProductionStatus")]
    pub production_status: i64,
    /// Current workorder identifier; forced empty while idle.
    #[serde(rename = "WorkorderId")]
    pub workorder_id: String,
    /// Good units since workorder start.
    #[serde(rename = "GoodCount")]
    pub good_count: i64,
    /// Rejected units since workorder start.
    #[serde(rename = "BadCount")]
    pub bad_count: i64,
    /// Process temperature in degrees Celsius.
    #[serde(rename = "Temperature")]
    pub temperature: f64,
}

impl TelemetrySample {
    /// Build a sample, forcing the workorder id empty whenever the
    /// production status indicates "not producing".
    pub fn new(
        production_status: i64,
        workorder_id: impl Into<String>,
        good_count: i64,
        bad_count: i64,
        temperature: f64,
    ) -> Self {
        let workorder_id = if production_status == 0 {
            String::new()
        } else {
            workorder_id.into()
        };
        Self {
            production_status,
            workorder_id,
            good_count,
            bad_count,
            temperature,
        }
    }

    /// Whether the device is currently producing.
    pub fn is_producing(&self) -> bool {
        self.production_status != 0
    }
}

/// Event body published when a device's active error count rises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Names of the newly active error flags.
    #[serde(rename = "DeviceError")]
    pub device_error: Vec<String>,
    /// Total number of active error conditions after the transition.
    #[serde(rename = "newErrors")]
    pub new_errors: u32,
}

impl ErrorEvent {
    /// Build the event for a rising error-count edge.
    pub fn rising(newly_active: DeviceErrorFlags, total_active: u32) -> Self {
        Self {
            device_error: newly_active
                .names()
                .into_iter()
                .map(str::to_owned)
                .collect(),
            new_errors: total_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bitset_renders_as_none() {
        let flags = DeviceErrorFlags::empty();
        assert_eq!(flags.render(), "None");
        assert_eq!(flags.active_count(), 0);
        assert!(flags.names().is_empty());
    }

    #[test]
    fn multiple_flags_render_in_bit_order() {
        let flags = DeviceErrorFlags::SENSOR_FAILURE | DeviceErrorFlags::EMERGENCY_STOP;
        assert_eq!(flags.render(), "EmergencyStop,SensorFailure");
        assert_eq!(flags.active_count(), 2);
    }

    #[test]
    fn raw_cast_discards_unknown_bits() {
        let flags = DeviceErrorFlags::from_raw(0b1111_0011);
        assert_eq!(
            flags,
            DeviceErrorFlags::EMERGENCY_STOP | DeviceErrorFlags::POWER_FAILURE
        );
    }

    #[test]
    fn newly_active_ignores_cleared_flags() {
        let previous = DeviceErrorFlags::POWER_FAILURE;
        let current = DeviceErrorFlags::SENSOR_FAILURE | DeviceErrorFlags::UNKNOWN;
        assert_eq!(
            current.newly_active(previous),
            DeviceErrorFlags::SENSOR_FAILURE | DeviceErrorFlags::UNKNOWN
        );
    }

    #[test]
    fn telemetry_sample_serializes_exactly_five_fields() {
        let sample = TelemetrySample::new(1, "wo-17", 120, 4, 61.3);
        let value = serde_json::to_value(&sample).expect("serialize sample");
        let object = value.as_object().expect("object body");
        assert_eq!(object.len(), 5);
        for field in [
            "ProductionStatus",
            "WorkorderId",
            "GoodCount",
            "BadCount",
            "Temperature",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
    }

    #[test]
    fn idle_sample_forces_empty_workorder() {
        let sample = TelemetrySample::new(0, "wo-17", 0, 0, 20.0);
        assert_eq!(sample.workorder_id, "");
        assert!(!sample.is_producing());
    }

    #[test]
    fn rising_error_event_carries_new_flag_names() {
        let newly = DeviceErrorFlags::POWER_FAILURE;
        let event = ErrorEvent::rising(newly, 2);
        assert_eq!(event.device_error, vec!["PowerFailure"]);
        assert_eq!(event.new_errors, 2);
    }
}

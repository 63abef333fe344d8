//! ---
//! vfab_section: "11-simulation-test-harness"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Simulated plant controllers and signal bridging."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::Normal;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;
use v_fab_msg::{node, DeviceErrorFlags};
use v_fab_net::{NetError, Result, TelemetrySource};

/// Units produced per second at 100% production rate.
const NOMINAL_UNITS_PER_SEC: f64 = 2.0;
const TEMPERATURE_BASE_C: f64 = 55.0;

/// Tuning knobs for the simulated controllers.
#[derive(Debug, Clone)]
pub struct PlcSettings {
    /// Seed for the deterministic noise generators.
    pub seed: u64,
    /// Per-second probability of a spontaneous device fault.
    pub fault_rate: f64,
    /// Share of produced units rejected as bad.
    pub bad_ratio: f64,
}

impl Default for PlcSettings {
    fn default() -> Self {
        Self {
            seed: 0xFAB5EED,
            fault_rate: 0.0,
            bad_ratio: 0.04,
        }
    }
}

struct PlcDevice {
    production_rate: i64,
    production_status: i64,
    workorder_id: String,
    good_count: i64,
    bad_count: i64,
    unit_carry: f64,
    temperature: f64,
    error_register: u8,
    last_advance: Instant,
}

impl PlcDevice {
    fn new(initial_rate: i64) -> Self {
        let producing = initial_rate > 0;
        Self {
            production_rate: initial_rate,
            production_status: i64::from(producing),
            workorder_id: if producing {
                Uuid::new_v4().to_string()
            } else {
                String::new()
            },
            good_count: 0,
            bad_count: 0,
            unit_carry: 0.0,
            temperature: TEMPERATURE_BASE_C,
            error_register: 0,
            last_advance: Instant::now(),
        }
    }

    fn stopped_by_error(&self) -> bool {
        DeviceErrorFlags::from_raw(i64::from(self.error_register))
            .contains(DeviceErrorFlags::EMERGENCY_STOP)
    }

    fn refresh_status(&mut self) {
        let producing = self.production_rate > 0 && !self.stopped_by_error();
        self.production_status = i64::from(producing);
        if producing && self.workorder_id.is_empty() {
            self.workorder_id = Uuid::new_v4().to_string();
        }
        if !producing {
            self.workorder_id.clear();
        }
    }
}

struct PlcState {
    rng: StdRng,
    noise: Normal<f64>,
    devices: HashMap<String, PlcDevice>,
}

/// Simulated plant controller cluster implementing the telemetry contract.
///
/// Each registered device owns a node subtree under its prefix; process
/// variables evolve with wall-clock time between reads. `EmergencyStop` and
/// `ResetErrorStatus` are exposed as method nodes on the device object.
pub struct SimulatedPlc {
    settings: PlcSettings,
    state: Mutex<PlcState>,
}

impl SimulatedPlc {
    /// Create an empty controller cluster.
    pub fn new(settings: PlcSettings) -> Self {
        let state = PlcState {
            rng: StdRng::seed_from_u64(settings.seed),
            noise: Normal::new(0.0, 1.0).expect("unit sigma is positive"),
            devices: HashMap::new(),
        };
        Self {
            settings,
            state: Mutex::new(state),
        }
    }

    /// Register a device subtree under `prefix` starting at `initial_rate`.
    pub fn register_device(&self, prefix: impl Into<String>, initial_rate: i64) {
        let prefix = prefix.into();
        self.state
            .lock()
            .devices
            .insert(prefix, PlcDevice::new(initial_rate));
    }

    /// Force error flags onto a device, as a hardware fault would.
    pub fn inject_error(&self, prefix: &str, flags: DeviceErrorFlags) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.get_mut(prefix) {
            device.error_register |= flags.bits();
            device.refresh_status();
        }
    }

    fn advance(settings: &PlcSettings, state: &mut PlcState, prefix: &str) {
        let noise = state.noise.sample(&mut state.rng);
        let fault_roll: f64 = state.rng.gen();
        let fault_pick: bool = state.rng.gen();
        let Some(device) = state.devices.get_mut(prefix) else {
            return;
        };

        let elapsed = device.last_advance.elapsed().as_secs_f64();
        device.last_advance = Instant::now();

        if device.production_status != 0 {
            let produced = device.production_rate as f64 / 100.0
                * NOMINAL_UNITS_PER_SEC
                * elapsed
                + device.unit_carry;
            let whole = produced.floor();
            device.unit_carry = produced - whole;
            let bad = (whole * settings.bad_ratio).round().min(whole);
            device.bad_count += bad as i64;
            device.good_count += (whole - bad) as i64;
        }

        device.temperature = TEMPERATURE_BASE_C
            + 20.0 * device.production_rate as f64 / 100.0
            + noise * 1.5;

        if fault_roll < (settings.fault_rate * elapsed).min(1.0) {
            let fault = if fault_pick {
                DeviceErrorFlags::POWER_FAILURE
            } else {
                DeviceErrorFlags::SENSOR_FAILURE
            };
            device.error_register |= fault.bits();
            debug!(device = prefix, fault = %fault, "simulated fault injected");
        }
    }

    fn split_node(node: &str) -> Result<(&str, &str)> {
        node.rsplit_once('/')
            .ok_or_else(|| NetError::UnknownNode(node.to_owned()))
    }
}

#[async_trait]
impl TelemetrySource for SimulatedPlc {
    async fn read_node(&self, node_path: &str) -> Result<Value> {
        let (prefix, field) = Self::split_node(node_path)?;
        let mut state = self.state.lock();
        Self::advance(&self.settings, &mut state, prefix);
        let device = state
            .devices
            .get(prefix)
            .ok_or_else(|| NetError::UnknownNode(node_path.to_owned()))?;
        let value = match field {
            node::PRODUCTION_STATUS => json!(device.production_status),
            node::PRODUCTION_RATE => json!(device.production_rate),
            node::WORKORDER_ID => json!(device.workorder_id),
            node::GOOD_COUNT => json!(device.good_count),
            node::BAD_COUNT => json!(device.bad_count),
            node::TEMPERATURE => json!(device.temperature),
            node::DEVICE_ERROR => json!(i64::from(device.error_register)),
            _ => return Err(NetError::UnknownNode(node_path.to_owned())),
        };
        Ok(value)
    }

    async fn write_node(&self, node_path: &str, value: Value) -> Result<()> {
        let (prefix, field) = Self::split_node(node_path)?;
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(prefix)
            .ok_or_else(|| NetError::UnknownNode(node_path.to_owned()))?;
        match field {
            node::PRODUCTION_RATE => {
                let rate = value
                    .as_i64()
                    .ok_or_else(|| NetError::Transient("ProductionRate must be an integer".into()))?;
                device.production_rate = rate.max(0);
                device.refresh_status();
            }
            node::DEVICE_ERROR => {
                let raw = value
                    .as_i64()
                    .ok_or_else(|| NetError::Transient("DeviceError must be an integer".into()))?;
                device.error_register = DeviceErrorFlags::from_raw(raw).bits();
                device.refresh_status();
            }
            _ => {
                return Err(NetError::Transient(format!(
                    "node {node_path} is not writable"
                )))
            }
        }
        Ok(())
    }

    async fn call_method(&self, object_node: &str, method_node: &str) -> Result<Option<Value>> {
        let method = method_node
            .rsplit_once('/')
            .map(|(_, method)| method)
            .unwrap_or(method_node);
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(object_node)
            .ok_or_else(|| NetError::UnknownNode(object_node.to_owned()))?;
        match method {
            "EmergencyStop" => {
                device.error_register |= DeviceErrorFlags::EMERGENCY_STOP.bits();
                device.refresh_status();
                debug!(device = object_node, "emergency stop engaged on controller");
                Ok(None)
            }
            "ResetErrorStatus" => {
                device.error_register = 0;
                device.refresh_status();
                debug!(device = object_node, "error status reset on controller");
                Ok(None)
            }
            _ => Err(NetError::UnknownNode(method_node.to_owned())),
        }
    }
}

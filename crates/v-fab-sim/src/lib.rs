//! ---
//! vfab_section: "11-simulation-test-harness"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Simulated plant controllers and signal bridging."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---

pub mod bridge;
pub mod plc;

pub use bridge::{BridgeSettings, SignalBridge};
pub use plc::{PlcSettings, SimulatedPlc};

//! ---
//! vfab_section: "01-fleet-runtime"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Shared primitives and utilities for the fleet runtime."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, DeviceConfig, EscalationSettings, LoggingConfig, NotifierConfig, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat};

//! ---
//! vfab_section: "01-fleet-runtime"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Shared primitives and utilities for the fleet runtime."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;
use v_fab_msg::{ERROR_QUEUE, PRODUCTION_QUEUE};

use crate::logging::LogFormat;

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_rate() -> i64 {
    60
}

fn default_production_queue() -> String {
    PRODUCTION_QUEUE.to_owned()
}

fn default_error_queue() -> String {
    ERROR_QUEUE.to_owned()
}

fn default_quality_threshold() -> f32 {
    90.0
}

fn default_error_threshold() -> i64 {
    3
}

fn default_rate_step() -> i64 {
    10
}

fn default_rate_floor() -> i64 {
    10
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_recipient() -> String {
    "operations@example.invalid".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_simulation_seed() -> u64 {
    0xFAB5EED
}

fn default_fault_rate() -> f64 {
    0.002
}

fn default_bad_ratio() -> f64 {
    0.04
}

fn default_bridge_window() -> Duration {
    Duration::from_secs(60)
}

/// Primary configuration object for the fleet runtime.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Devices in the fleet, keyed by device identifier.
    #[serde(default)]
    pub fleet: IndexMap<String, DeviceConfig>,
    /// Fixed delay between reconciliation cycles.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub escalation: EscalationSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "V_FAB_CONFIG";

    /// Load configuration from disk, respecting the `V_FAB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a device configuration by identifier.
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.fleet.get(device_id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.fleet.is_empty() {
            return Err(anyhow!("configuration must declare at least one device"));
        }
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval must be positive"));
        }
        self.escalation.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fleet: IndexMap::new(),
            poll_interval: default_poll_interval(),
            escalation: EscalationSettings::default(),
            logging: LoggingConfig::default(),
            notifier: NotifierConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Per-device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Node prefix on the telemetry source; defaults to the device id.
    #[serde(default)]
    pub node_prefix: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Production rate the simulated controller starts at.
    #[serde(default = "default_initial_rate")]
    pub initial_rate: i64,
}

impl DeviceConfig {
    /// Effective node prefix for a device.
    pub fn node_prefix_or<'a>(&'a self, device_id: &'a str) -> &'a str {
        self.node_prefix.as_deref().unwrap_or(device_id)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            node_prefix: None,
            description: None,
            initial_rate: default_initial_rate(),
        }
    }
}

/// Escalation policy knobs. The defaults are the fleet policy; configuration
/// exists for test rigs, not for tuning production behaviour.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSettings {
    #[serde(default = "default_production_queue")]
    pub production_queue: String,
    #[serde(default = "default_error_queue")]
    pub error_queue: String,
    /// Good-production percentage below which throttling starts (exclusive).
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    /// Error count above which an emergency stop is issued (exclusive).
    #[serde(default = "default_error_threshold")]
    pub error_threshold: i64,
    /// Production-rate decrement per throttle action.
    #[serde(default = "default_rate_step")]
    pub rate_step: i64,
    /// Rates below this floor are never decreased further.
    #[serde(default = "default_rate_floor")]
    pub rate_floor: i64,
    /// Bounded wait for a command invocation response.
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,
}

impl EscalationSettings {
    fn validate(&self) -> Result<()> {
        if self.production_queue == self.error_queue {
            return Err(anyhow!("production and error queues must be distinct"));
        }
        if !(0.0..=100.0).contains(&self.quality_threshold) {
            return Err(anyhow!("quality_threshold must be within 0..=100"));
        }
        if self.rate_step <= 0 {
            return Err(anyhow!("rate_step must be positive"));
        }
        if self.rate_floor < 0 {
            return Err(anyhow!("rate_floor must not be negative"));
        }
        Ok(())
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            production_queue: default_production_queue(),
            error_queue: default_error_queue(),
            quality_threshold: default_quality_threshold(),
            error_threshold: default_error_threshold(),
            rate_step: default_rate_step(),
            rate_floor: default_rate_floor(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Human recipient of fleet alerts.
    #[serde(default = "default_recipient")]
    pub recipient: String,
    /// Optional HTTP gateway; alerts go to the log stream when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            recipient: default_recipient(),
            webhook_url: None,
        }
    }
}

/// Logging configuration consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            file_prefix: None,
            format: default_log_format(),
        }
    }
}

/// Settings for the simulated plant controllers and the signal bridge.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed for the deterministic process-noise generators.
    #[serde(default = "default_simulation_seed")]
    pub seed: u64,
    /// Per-cycle probability of a spontaneous device fault.
    #[serde(default = "default_fault_rate")]
    pub fault_rate: f64,
    /// Share of produced units rejected as bad.
    #[serde(default = "default_bad_ratio")]
    pub bad_ratio: f64,
    /// Aggregation window of the event-to-signal bridge.
    #[serde(default = "default_bridge_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub bridge_window: Duration,
}

impl SimulationConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [("fault_rate", self.fault_rate), ("bad_ratio", self.bad_ratio)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{name} must be within 0..=1"));
            }
        }
        if self.bridge_window.is_zero() {
            return Err(anyhow!("bridge_window must be positive"));
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_simulation_seed(),
            fault_rate: default_fault_rate(),
            bad_ratio: default_bad_ratio(),
            bridge_window: default_bridge_window(),
        }
    }
}

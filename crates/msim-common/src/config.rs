//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the simulator runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_endpoint_address() -> String {
    "loopback://meters.local".to_owned()
}

fn default_send_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_receive_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_temperature_baseline() -> f64 {
    100.0
}

fn default_temperature_offset_min() -> i32 {
    -6
}

fn default_temperature_offset_max() -> i32 {
    5
}

fn default_voltage_baseline() -> f64 {
    0.002
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_connect_backoff() -> Duration {
    Duration::from_millis(250)
}

/// Primary configuration object for the simulator runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub devices: IndexMap<String, DeviceConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "MSIM_CONFIG";

    /// Load configuration from disk, respecting the `MSIM_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
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

    /// Read and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Retrieve a device configuration by identifier.
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.get(device_id)
    }

    /// Endpoint a device connects to: its own override or the fleet default.
    pub fn endpoint_for<'a>(&'a self, device: &'a DeviceConfig) -> &'a str {
        device
            .endpoint
            .as_deref()
            .unwrap_or(self.endpoint.address.as_str())
    }

    /// Seed for the device at `index`, derived from the fleet seed when one is set.
    pub fn device_seed(&self, index: usize) -> Option<u64> {
        self.simulation
            .random_seed
            .map(|seed| seed.wrapping_add(index as u64))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(anyhow!("configuration must contain at least one device"));
        }
        self.simulation.validate()?;
        if self.endpoint.address.trim().is_empty() {
            return Err(anyhow!("endpoint address must not be empty"));
        }
        for (device_id, device) in &self.devices {
            device.validate(device_id)?;
        }
        Ok(())
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Remote endpoint that devices without their own override connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_endpoint_address")]
    pub address: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: default_endpoint_address(),
        }
    }
}

/// Reading generator and loop scheduling parameters shared by the fleet.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub random_seed: Option<u64>,
    #[serde(default = "default_send_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub send_interval: Duration,
    #[serde(default = "default_receive_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub receive_interval: Duration,
    #[serde(default = "default_temperature_baseline")]
    pub temperature_baseline: f64,
    #[serde(default = "default_temperature_offset_min")]
    pub temperature_offset_min: i32,
    #[serde(default = "default_temperature_offset_max")]
    pub temperature_offset_max: i32,
    #[serde(default = "default_voltage_baseline")]
    pub voltage_baseline: f64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_backoff: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            random_seed: None,
            send_interval: default_send_interval(),
            receive_interval: default_receive_interval(),
            temperature_baseline: default_temperature_baseline(),
            temperature_offset_min: default_temperature_offset_min(),
            temperature_offset_max: default_temperature_offset_max(),
            voltage_baseline: default_voltage_baseline(),
            connect_attempts: default_connect_attempts(),
            connect_backoff: default_connect_backoff(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.send_interval.is_zero() || self.receive_interval.is_zero() {
            return Err(anyhow!("simulation send/receive intervals must be non-zero"));
        }
        if self.temperature_offset_min > self.temperature_offset_max {
            return Err(anyhow!(
                "temperature offset range [{}, {}] is empty",
                self.temperature_offset_min,
                self.temperature_offset_max
            ));
        }
        if self.connect_attempts == 0 {
            return Err(anyhow!("connect_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Per-device provisioning and schedule overrides.
#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub send_interval: Option<Duration>,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub receive_interval: Option<Duration>,
}

impl DeviceConfig {
    pub fn validate(&self, device_id: &str) -> Result<()> {
        if device_id.trim().is_empty() {
            return Err(anyhow!("device identifiers must not be empty"));
        }
        if matches!(&self.credential, Some(key) if key.trim().is_empty()) {
            return Err(anyhow!("device '{}' declares a blank credential", device_id));
        }
        if matches!(self.send_interval, Some(interval) if interval.is_zero())
            || matches!(self.receive_interval, Some(interval) if interval.is_zero())
        {
            return Err(anyhow!(
                "device '{}' intervals must be non-zero",
                device_id
            ));
        }
        Ok(())
    }

    pub fn send_interval_or(&self, simulation: &SimulationConfig) -> Duration {
        self.send_interval.unwrap_or(simulation.send_interval)
    }

    pub fn receive_interval_or(&self, simulation: &SimulationConfig) -> Duration {
        self.receive_interval.unwrap_or(simulation.receive_interval)
    }
}

// src/config.rs - Host settings loaded from one TOML file
//! # Host Configuration
//!
//! This module defines the configuration structs for the bus transport, the messenger,
//! move-group execution, sensor thresholds and the probing defaults used by the CLI.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [bus]
//! transport = "serial"
//! serial = "/dev/ttyACM0"
//! baud = 115200
//!
//! [motion]
//! setup_timeout_ms = 500
//! execution_timeout_factor = 2.5
//!
//! [sensors]
//! threshold_timeout_ms = 250
//! ```
//!
//! - Every field has a default, so an empty file is a valid configuration.
//! - `motion.execution_retries` must stay at 0: execution failures are never retried here.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the bus, messenger, motion, sensors and probing defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Sim,
}

/// Bus transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            serial: "".to_string(),
            baud: default_baud(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Messenger timing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessengerConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Subscriptions holding more undrained messages than this get a warning.
    #[serde(default = "default_subscription_warn_depth")]
    pub subscription_warn_depth: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            subscription_warn_depth: default_subscription_warn_depth(),
        }
    }
}

impl MessengerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Move group preparation and execution limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    #[serde(default = "default_timeout_ms")]
    pub setup_timeout_ms: u64,
    #[serde(default = "default_execution_timeout_factor")]
    pub execution_timeout_factor: f64,
    #[serde(default = "default_timeout_ms")]
    pub execution_timeout_margin_ms: u64,
    #[serde(default)]
    pub execution_retries: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: default_timeout_ms(),
            execution_timeout_factor: default_execution_timeout_factor(),
            execution_timeout_margin_ms: default_timeout_ms(),
            execution_retries: 0,
        }
    }
}

impl MotionConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    /// Completion deadline for a group commanded for `nominal`.
    ///
    /// Saturates at `Duration::MAX` rather than overflowing.
    pub fn execution_timeout(&self, nominal: Duration) -> Duration {
        Duration::try_from_secs_f64(nominal.as_secs_f64() * self.execution_timeout_factor)
            .unwrap_or(Duration::MAX)
            .saturating_add(Duration::from_millis(self.execution_timeout_margin_ms))
    }
}

/// Sensor request timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorConfig {
    #[serde(default = "default_timeout_ms")]
    pub threshold_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub bind_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            threshold_timeout_ms: default_timeout_ms(),
            bind_timeout_ms: default_timeout_ms(),
        }
    }
}

impl SensorConfig {
    pub fn threshold_timeout(&self) -> Duration {
        Duration::from_millis(self.threshold_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

/// Defaults for the probing commands of the host CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_distance")]
    pub distance: f64,
    #[serde(default = "default_probe_speed")]
    pub speed: f64,
    #[serde(default = "default_capacitive_threshold")]
    pub capacitive_threshold_pf: f64,
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold_pa: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            distance: default_probe_distance(),
            speed: default_probe_speed(),
            capacitive_threshold_pf: default_capacitive_threshold(),
            pressure_threshold_pa: default_pressure_threshold(),
        }
    }
}

impl Config {
    /// Validate timing and policy fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.max_frame_len < 8 || self.bus.max_frame_len > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "bus.max_frame_len must be between 8 and {}",
                u16::MAX
            )));
        }
        if self.bus.transport == TransportKind::Serial && self.bus.serial.is_empty() {
            return Err(ConfigError::Invalid(
                "bus.serial must name a device when transport = \"serial\"".to_string(),
            ));
        }
        let timeouts = [
            ("messenger.default_timeout_ms", self.messenger.default_timeout_ms),
            ("motion.setup_timeout_ms", self.motion.setup_timeout_ms),
            ("sensors.threshold_timeout_ms", self.sensors.threshold_timeout_ms),
            ("sensors.bind_timeout_ms", self.sensors.bind_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
        }
        let factor = self.motion.execution_timeout_factor;
        if !(factor >= 1.0 && factor.is_finite()) {
            return Err(ConfigError::Invalid(
                "motion.execution_timeout_factor must be a finite value >= 1.0".to_string(),
            ));
        }
        if self.motion.execution_retries != 0 {
            return Err(ConfigError::Invalid(
                "motion.execution_retries is not supported; execution failures are fatal".to_string(),
            ));
        }
        if self.probe.speed <= 0.0 {
            return Err(ConfigError::Invalid("probe.speed must be > 0".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_transport() -> TransportKind { TransportKind::Sim }
fn default_baud() -> u32 { 115200 }
fn default_max_frame_len() -> usize { 256 }
fn default_timeout_ms() -> u64 { 1000 }
fn default_subscription_warn_depth() -> usize { 1024 }
fn default_execution_timeout_factor() -> f64 { 2.0 }
fn default_probe_distance() -> f64 { 20.0 }
fn default_probe_speed() -> f64 { 5.0 }
fn default_capacitive_threshold() -> f64 { 1.0 }
fn default_pressure_threshold() -> f64 { 1.0 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

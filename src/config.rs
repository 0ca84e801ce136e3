//! Configuration loading using Figment.
//!
//! Configuration is layered:
//! 1. built-in defaults
//! 2. `config/smu.toml` (or an explicit file)
//! 3. environment variables prefixed with `SMU_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use rust_smu::config::SmuConfig;
//!
//! let config = SmuConfig::load()?;
//! config.validate()?;
//! println!("Queue size: {}", config.session.queue_size);
//! # Ok::<(), rust_smu::error::SmuError>(())
//! ```
//!
//! `SMU_SESSION__QUEUE_SIZE=500` overrides `session.queue_size`.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::device::{StreamSettings, DEFAULT_TRANSFER_SIZE};
use crate::error::{AppResult, SmuError};
use crate::queue::DEFAULT_QUEUE_SIZE;
use crate::transport::sim::DEFAULT_LOAD_OHMS;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SMU_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmuConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session and streaming settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Simulated hardware used by the CLI
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of every per-channel sample queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Sample rate in Hz, 0 selects each device's default
    #[serde(default)]
    pub sample_rate: u32,
    /// Frames exchanged per bulk transfer
    #[serde(default = "default_transfer_size")]
    pub transfer_size: usize,
    /// Timeout for control requests in milliseconds
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,
}

/// Simulated hardware configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of devices attached at start-up
    #[serde(default = "default_devices")]
    pub devices: usize,
    /// Pace transfers at the sample rate
    #[serde(default = "default_realtime")]
    pub realtime: bool,
    /// Load resistor on every channel, in ohms
    #[serde(default = "default_load_ohms")]
    pub load_ohms: f32,
    /// Amplitude of measurement noise
    #[serde(default)]
    pub noise: f32,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_transfer_size() -> usize {
    DEFAULT_TRANSFER_SIZE
}

fn default_control_timeout() -> u64 {
    100
}

fn default_devices() -> usize {
    1
}

fn default_realtime() -> bool {
    true
}

fn default_load_ohms() -> f32 {
    DEFAULT_LOAD_OHMS
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            sample_rate: 0,
            transfer_size: default_transfer_size(),
            control_timeout_ms: default_control_timeout(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            realtime: default_realtime(),
            load_ohms: default_load_ohms(),
            noise: 0.0,
        }
    }
}

impl SessionConfig {
    /// Streaming parameters handed to devices.
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            sample_rate: self.sample_rate,
            queue_size: self.queue_size,
            transfer_size: self.transfer_size,
        }
    }

    /// Control request timeout.
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl SmuConfig {
    /// Load from `config/smu.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(SmuConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SmuError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(SmuError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.session.queue_size == 0 {
            return Err(SmuError::Configuration(
                "session.queue_size must be positive".to_string(),
            ));
        }
        if self.session.transfer_size == 0 {
            return Err(SmuError::Configuration(
                "session.transfer_size must be positive".to_string(),
            ));
        }

        let load = self.simulation.load_ohms;
        if !load.is_finite() || load <= 0.0 {
            return Err(SmuError::Configuration(format!(
                "Invalid simulation.load_ohms {load}. Must be positive"
            )));
        }
        if !self.simulation.noise.is_finite() || self.simulation.noise < 0.0 {
            return Err(SmuError::Configuration(format!(
                "Invalid simulation.noise {}. Must be non-negative",
                self.simulation.noise
            )));
        }

        Ok(())
    }
}

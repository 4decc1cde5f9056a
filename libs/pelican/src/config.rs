//! Device configuration
//!
//! Loaded from YAML/TOML/JSON with `PELICAN_`-prefixed environment
//! overrides, e.g. `PELICAN_BITRATE_KBPS=500` or `PELICAN_LOG__LEVEL=debug`.

use pelican_common::config::{load_config, load_config_with_env};
use pelican_common::{LogConfig, WorkerGuard};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::driver::ChipSettings;
use crate::error::Result;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "PELICAN_";

/// Upper bound for either frame buffer
pub const MAX_BUFFER_FRAMES: usize = 65_536;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bus bit rate in kbit/s
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    /// Send every frame in extended format
    #[serde(default)]
    pub extended: bool,
    /// Board-specific output control register value
    #[serde(default = "default_output_control")]
    pub output_control: u8,
    /// Inbound (driver to client) buffer capacity in frames
    #[serde(default = "default_rx_capacity")]
    pub rx_capacity: usize,
    /// Outbound (client to driver) buffer capacity in frames
    #[serde(default = "default_tx_capacity")]
    pub tx_capacity: usize,
    /// Missed transmit-complete threshold
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Outbound depth above which the queue is flushed
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
    /// Host logging, installed by [`DeviceConfig::init_logging`]
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: default_bitrate_kbps(),
            extended: false,
            output_control: default_output_control(),
            rx_capacity: default_rx_capacity(),
            tx_capacity: default_tx_capacity(),
            heartbeat_ms: default_heartbeat_ms(),
            backlog_limit: default_backlog_limit(),
            log: LogConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Load from `config/pelican.*`, `config/local.*` and the environment
    pub fn load() -> Result<Self> {
        let config: Self = load_config("pelican")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file plus environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_config_with_env(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bitrate_kbps == 0 {
            return Err(invalid("bitrate_kbps must be non-zero"));
        }
        if self.rx_capacity == 0 {
            return Err(invalid("rx_capacity must be non-zero"));
        }
        if self.rx_capacity > MAX_BUFFER_FRAMES || self.tx_capacity > MAX_BUFFER_FRAMES {
            return Err(invalid(format!(
                "buffer capacities must not exceed {} frames",
                MAX_BUFFER_FRAMES
            )));
        }
        if self.heartbeat_ms == 0 {
            return Err(invalid("heartbeat_ms must be non-zero"));
        }
        // Backlog flush must trigger before the ring starts evicting
        if self.tx_capacity <= self.backlog_limit {
            return Err(invalid(format!(
                "tx_capacity ({}) must exceed backlog_limit ({})",
                self.tx_capacity, self.backlog_limit
            )));
        }
        Ok(())
    }

    /// Install the global tracing subscriber described by `log`
    ///
    /// Keep the returned guard alive while file logging is wanted.
    pub fn init_logging(&self) -> Result<Option<WorkerGuard>> {
        Ok(pelican_common::init_logging(&self.log)?)
    }

    /// Chip settings with the acceptance filter open
    pub fn chip_settings(&self) -> ChipSettings {
        ChipSettings {
            bitrate_kbps: self.bitrate_kbps,
            output_control: self.output_control,
            ..ChipSettings::default()
        }
    }
}

fn invalid(msg: impl Into<String>) -> crate::error::CanError {
    pelican_common::Error::config(msg).into()
}

// Default value functions
fn default_bitrate_kbps() -> u32 {
    250
}
fn default_output_control() -> u8 {
    0xDA
}
fn default_rx_capacity() -> usize {
    256
}
fn default_tx_capacity() -> usize {
    64
}
fn default_heartbeat_ms() -> u64 {
    1000
}
fn default_backlog_limit() -> usize {
    10
}

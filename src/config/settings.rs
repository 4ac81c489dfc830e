//! Hub settings

use crate::core::protocol::dcb::Model;
use crate::core::session::LinkConfig;
use crate::core::transport::{SerialParity, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Highest thermostat address on a UH1 bus
pub const MAX_DEVICE_ID: u8 = 32;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config file {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Settings are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Link address could not be parsed
    #[error("invalid link address: {0}")]
    Address(#[from] TransportError),

    /// No platform config directory
    #[error("could not determine config directory")]
    NoConfigDir,
}

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Link address: `host:port`, `socket://host:port`, `tcp://host:port`
    /// or a serial device path with optional `@baud`
    pub address: String,
    /// Link timing
    pub timing: TimingConfig,
    /// Serial line settings, used for serial addresses
    pub serial: SerialSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Thermostats on the bus
    pub devices: Vec<DeviceConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            address: "/dev/ttyUSB0".to_string(),
            timing: TimingConfig::default(),
            serial: SerialSettings::default(),
            logging: LoggingConfig::default(),
            devices: Vec::new(),
        }
    }
}

/// Link timing, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Window for a read response
    pub device_timeout_ms: u64,
    /// Window for a write acknowledgement
    pub write_timeout_ms: u64,
    /// Longest wait for a busy link
    pub contention_timeout_ms: u64,
    /// Quiet time after each transaction
    pub pacing_ms: u64,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: 3000,
            write_timeout_ms: 3000,
            contention_timeout_ms: 2000,
            pacing_ms: 100,
            connect_timeout_ms: 5000,
        }
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate, unless the address carries `@baud`
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 4800,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
    /// Also write logs to this file (daily rotation)
    pub file: Option<PathBuf>,
    /// Record every frame to this file
    pub trace_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
            trace_file: None,
        }
    }
}

/// One thermostat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bus address (1-32)
    pub id: u8,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Model
    #[serde(default)]
    pub model: Model,
}

impl DeviceConfig {
    /// Create a device entry
    pub fn new(id: u8, name: &str, model: Model) -> Self {
        Self {
            id,
            name: name.to_string(),
            model,
        }
    }

    /// Name, or a generated one when unset
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Thermostat {}", self.id)
        } else {
            self.name.clone()
        }
    }
}

impl HubConfig {
    /// Load from the default location, or defaults when no file exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate a config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty TOML, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, content).map_err(io_err)
    }

    /// Check device ids and timings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if device.id == 0 || device.id > MAX_DEVICE_ID {
                return Err(ConfigError::Invalid(format!(
                    "device id {} outside 1..={MAX_DEVICE_ID}",
                    device.id
                )));
            }
            if !seen.insert(device.id) {
                return Err(ConfigError::Invalid(format!(
                    "device id {} listed twice",
                    device.id
                )));
            }
        }

        let timing = &self.timing;
        for (name, value) in [
            ("device_timeout_ms", timing.device_timeout_ms),
            ("write_timeout_ms", timing.write_timeout_ms),
            ("contention_timeout_ms", timing.contention_timeout_ms),
            ("connect_timeout_ms", timing.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Session timing
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig::default()
            .device_timeout(Duration::from_millis(self.timing.device_timeout_ms))
            .write_timeout(Duration::from_millis(self.timing.write_timeout_ms))
            .contention_timeout(Duration::from_millis(self.timing.contention_timeout_ms))
            .pacing(Duration::from_millis(self.timing.pacing_ms))
    }

    /// Transport for the configured address
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        let transport = Transport::parse(&self.address)?
            .with_connect_timeout(Duration::from_millis(self.timing.connect_timeout_ms));
        Ok(match transport {
            Transport::Serial(mut cfg) => {
                if !self.address.contains('@') {
                    cfg.baud_rate = self.serial.baud_rate;
                }
                Transport::Serial(
                    cfg.data_bits(self.serial.data_bits)
                        .stop_bits(self.serial.stop_bits)
                        .parity(self.serial.parity),
                )
            }
            other => other,
        })
    }

    /// `(id, model)` of every device, in file order
    pub fn device_list(&self) -> Vec<(u8, Model)> {
        self.devices.iter().map(|d| (d.id, d.model)).collect()
    }

    /// Look up a device entry
    pub fn device(&self, id: u8) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

//! Configuration management for Hestia
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{HestiaError, Result};
use crate::settings::SettingsProfile;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// MeterHub aggregator connection
    pub meterhub: MeterHubConfig,

    /// Battery management serial link
    pub bms: BmsConfig,

    /// Safety limits checked every cycle
    pub limits: LimitsConfig,

    /// Flight-recorder ring buffer
    pub blackbox: BlackboxConfig,

    /// Web server binding configuration
    pub web: WebConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Control cycle period in milliseconds
    pub cycle_ms: u64,

    /// Settings profiles; index 0 is the base profile
    pub settings: Vec<SettingsProfile>,
}

/// MeterHub HTTP endpoint parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterHubConfig {
    /// Data endpoint URL
    pub url: String,

    /// Request timeout in milliseconds
    pub timeout_ms: u64,

    /// How long the last good sample stays valid, in seconds
    pub lifetime_secs: u64,
}

/// Pylontech serial link parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmsConfig {
    /// Serial device path
    pub port: String,

    /// Baud rate (packs ship at 115200)
    pub baudrate: u32,

    /// Number of packs on the RS485 bus
    pub pack_count: usize,

    /// How long a pack reading stays fresh, in seconds
    pub lifetime_secs: u64,

    /// Pause between consecutive pack reads, in milliseconds
    pub pause_ms: u64,
}

/// Safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum battery voltage in V
    pub voltage_max: f64,

    /// Maximum battery temperature in degrees Celsius
    pub temperature_max: f64,
}

/// Flight-recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboxConfig {
    /// Number of cycle records kept in memory
    pub size: usize,

    /// Directory dump files are written to
    pub path: String,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// TCP port
    pub port: u16,

    /// Directory with the static dashboard files
    pub static_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    pub level: String,

    /// Path to log file
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Default for MeterHubConfig {
    fn default() -> Self {
        Self {
            url: "http://meterhub:8008/data".to_string(),
            timeout_ms: 500,
            lifetime_secs: 10,
        }
    }
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 115_200,
            pack_count: 2,
            lifetime_secs: 20,
            pause_ms: 250,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            voltage_max: 54.0,
            temperature_max: 40.0,
        }
    }
}

impl Default for BlackboxConfig {
    fn default() -> Self {
        Self {
            size: 80,
            path: "log".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: "web".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "log/hestia.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meterhub: MeterHubConfig::default(),
            bms: BmsConfig::default(),
            limits: LimitsConfig::default(),
            blackbox: BlackboxConfig::default(),
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
            cycle_ms: 750,
            settings: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default locations, falling back to the
    /// built-in defaults when no file exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "hestia_config.yaml",
            "/data/hestia_config.yaml",
            "/etc/hestia/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.meterhub.url.is_empty() {
            return Err(HestiaError::validation(
                "meterhub.url",
                "URL cannot be empty",
            ));
        }

        if self.bms.port.is_empty() {
            return Err(HestiaError::validation(
                "bms.port",
                "Serial port cannot be empty",
            ));
        }

        if self.bms.pack_count == 0 {
            return Err(HestiaError::validation(
                "bms.pack_count",
                "At least one pack is required",
            ));
        }

        if self.bms.baudrate == 0 {
            return Err(HestiaError::validation(
                "bms.baudrate",
                "Baud rate must be greater than 0",
            ));
        }

        if self.limits.voltage_max <= 0.0 {
            return Err(HestiaError::validation(
                "limits.voltage_max",
                "Must be positive",
            ));
        }

        if self.blackbox.size == 0 {
            return Err(HestiaError::validation(
                "blackbox.size",
                "Must be greater than 0",
            ));
        }

        if self.cycle_ms == 0 {
            return Err(HestiaError::validation(
                "cycle_ms",
                "Cycle period must be greater than 0",
            ));
        }

        if self.web.port == 0 {
            return Err(HestiaError::validation(
                "web.port",
                "Port must be greater than 0",
            ));
        }

        // profile 0 must be complete; the resolver falls back to it
        crate::settings::SettingsBook::new(self.settings.clone())?;

        Ok(())
    }
}

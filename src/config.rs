//! Configuration management for the Sinapsi Alfa driver
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files.

use crate::error::{AlfaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lower bound for the poll interval in seconds
pub const MIN_SCAN_INTERVAL_S: u64 = 10;
/// Upper bound for the poll interval in seconds
pub const MAX_SCAN_INTERVAL_S: u64 = 600;
/// Lower bound for the per-request timeout in seconds
pub const MIN_TIMEOUT_S: u64 = 5;
/// Upper bound for the per-request timeout in seconds
pub const MAX_TIMEOUT_S: u64 = 60;
/// Bounds for the consecutive-failure threshold
pub const MIN_FAILURE_THRESHOLD: u32 = 1;
pub const MAX_FAILURE_THRESHOLD: u32 = 10;

fn default_true() -> bool {
    true
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device connection configuration
    pub device: DeviceConfig,

    /// Failure tracking and recovery configuration
    #[serde(default)]
    pub failure: FailureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus TCP connection parameters for one Alfa device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name of the device
    pub name: String,

    /// IP address or hostname of the device
    pub host: String,

    /// TCP port (typically 502)
    pub port: u16,

    /// Modbus unit/slave identifier
    pub slave_id: u8,

    /// Poll interval in seconds
    pub scan_interval_s: u64,

    /// Per-request timeout in seconds
    pub timeout_s: u64,

    /// Skip MAC-address detection and use a host:port derived identity
    #[serde(default)]
    pub skip_mac_detection: bool,
}

/// Failure tracking, repair notification and recovery options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    /// Consecutive failed cycles before an issue is opened
    pub threshold: u32,

    /// Whether to surface repair/recovery notifications
    pub notifications_enabled: bool,

    /// Optional command executed once per failure episode (fire-and-forget)
    pub recovery_command: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Directory for rotated log files
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,

    /// Whether to write log files at all
    #[serde(default = "default_true")]
    pub file_output: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Alfa".to_string(),
            host: "192.168.1.100".to_string(),
            port: 502,
            slave_id: 1,
            scan_interval_s: 60,
            timeout_s: 5,
            skip_mac_detection: false,
        }
    }
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            notifications_enabled: true,
            recovery_command: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: "/tmp/sinapsi-alfa".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
            file_output: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            failure: FailureConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Validate a hostname or IP address literal
pub fn host_valid(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return true;
    }
    // Hostname: dot-separated labels of alphanumerics and hyphens
    host.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let default_paths = [
            "sinapsi_alfa.yaml",
            "/data/sinapsi_alfa.yaml",
            "/etc/sinapsi-alfa/config.yaml",
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
        if self.device.name.is_empty() {
            return Err(AlfaError::validation(
                "device.name",
                "Device name cannot be empty",
            ));
        }

        if !host_valid(&self.device.host) {
            return Err(AlfaError::validation(
                "device.host",
                "Host must be a valid IP address or hostname",
            ));
        }

        if self.device.port == 0 {
            return Err(AlfaError::validation(
                "device.port",
                "Port must be between 1 and 65535",
            ));
        }

        if !(MIN_SCAN_INTERVAL_S..=MAX_SCAN_INTERVAL_S).contains(&self.device.scan_interval_s) {
            return Err(AlfaError::validation(
                "device.scan_interval_s",
                "Scan interval must be between 10 and 600 seconds",
            ));
        }

        if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&self.device.timeout_s) {
            return Err(AlfaError::validation(
                "device.timeout_s",
                "Timeout must be between 5 and 60 seconds",
            ));
        }

        if self.device.timeout_s >= self.device.scan_interval_s {
            return Err(AlfaError::validation(
                "device.timeout_s",
                "Timeout must be shorter than the scan interval",
            ));
        }

        if !(MIN_FAILURE_THRESHOLD..=MAX_FAILURE_THRESHOLD).contains(&self.failure.threshold) {
            return Err(AlfaError::validation(
                "failure.threshold",
                "Failure threshold must be between 1 and 10",
            ));
        }

        if let Some(cmd) = &self.failure.recovery_command {
            if cmd.trim().is_empty() {
                return Err(AlfaError::validation(
                    "failure.recovery_command",
                    "Recovery command cannot be blank",
                ));
            }
        }

        Ok(())
    }
}

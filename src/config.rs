//! Configuration management for Helios
//!
//! This module handles loading, validation, and management of the static
//! controller configuration from YAML files. The strategy section only seeds
//! the persisted settings; once stored, the persisted copy is authoritative.

use crate::error::{HeliosError, Result};
use crate::strategy::ChargingStrategyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod defaults;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Charging station UDP endpoint
    pub device: DeviceConfig,

    /// Electrical limits of the charger installation
    pub charger: ChargerConfig,

    /// Initial strategy settings (seeded into persistence on first run)
    pub strategy: ChargingStrategyConfig,

    /// Home battery interlock integration
    pub battery: BatteryConfig,

    /// Energy meter live-data source
    pub meter: MeterConfig,

    /// State file and log sink
    pub persistence: PersistenceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Evaluation interval in milliseconds
    pub poll_interval_ms: u64,
}

/// Charging station UDP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host name or IP address of the charging station (empty = not configured)
    pub host: String,

    /// UDP port the station listens on
    pub port: u16,

    /// Local address the transport socket binds to
    pub bind_address: String,

    /// Deadline for a single command round trip
    pub response_timeout_ms: u64,

    /// Pause after a timed-out command before the queue resumes
    pub cooldown_ms: u64,
}

impl DeviceConfig {
    /// `host:port` of the charging station, if one is configured
    pub fn address(&self) -> Option<String> {
        let host = self.host.trim();
        if host.is_empty() {
            None
        } else {
            Some(format!("{}:{}", host, self.port))
        }
    }
}

/// Electrical limits of the charger installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargerConfig {
    /// Nominal phase voltage used to convert power to current
    pub nominal_voltage: f64,

    /// Lowest current the charger accepts (IEC 61851 minimum)
    pub min_current_ampere: u32,

    /// Rated maximum when charging on one phase
    pub max_current_single_phase: u32,

    /// Rated maximum when charging on three phases
    pub max_current_three_phase: u32,

    /// Measured power above which the station counts as really charging
    pub charging_power_floor_watt: f64,

    /// Per-phase current above which a phase counts as active
    pub active_phase_current_ma: u32,
}

/// Battery discharge protection for vehicle-priority charging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DischargeProtectionConfig {
    /// Battery power (negative = discharging) below which the timer runs
    pub threshold_watt: f64,

    /// Seconds of continuous discharge before the derate applies
    pub duration_seconds: u64,

    /// Amperes removed from the requested current while derated
    pub derate_ampere: u32,
}

/// Home battery interlock integration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Whether strategy changes drive the interlock at all
    pub enabled: bool,

    /// Command line that locks battery discharge
    pub lock_discharge_command: String,

    /// Command line that unlocks battery discharge
    pub unlock_discharge_command: String,

    /// Command line that enables charging the battery from the grid
    pub enable_grid_charge_command: String,

    /// Command line that disables charging the battery from the grid
    pub disable_grid_charge_command: String,

    /// Minimum spacing between two interlock commands
    pub min_command_interval_seconds: u64,

    /// Kill a command that runs longer than this
    pub command_timeout_seconds: u64,

    /// Discharge protection applied by vehicle-priority charging
    pub protection: DischargeProtectionConfig,
}

/// Energy meter live-data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// JSON document maintained by the meter exporter
    pub live_data_file: String,

    /// HTTP endpoint serving the same document (meter-http feature)
    pub url: String,

    /// Live data older than this is rejected
    pub max_age_seconds: u64,
}

/// State file and log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// JSON file holding settings, context, control state and log
    pub state_file: String,

    /// Maximum entries kept in the bounded log sink
    pub log_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level
    pub console_level: Option<String>,

    /// Optional file-specific level
    pub file_level: Option<String>,

    /// Path to log file (its directory receives the rolling files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "helios_config.yaml",
            "/data/helios_config.yaml",
            "/etc/helios/config.yaml",
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
        if self.device.port == 0 {
            return Err(HeliosError::validation(
                "device.port",
                "Port must be greater than 0",
            ));
        }

        if self.device.response_timeout_ms == 0 {
            return Err(HeliosError::validation(
                "device.response_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if !(self.charger.nominal_voltage > 0.0) {
            return Err(HeliosError::validation(
                "charger.nominal_voltage",
                "Must be positive",
            ));
        }

        if self.charger.min_current_ampere == 0
            || self.charger.min_current_ampere > self.charger.max_current_single_phase
            || self.charger.min_current_ampere > self.charger.max_current_three_phase
        {
            return Err(HeliosError::validation(
                "charger.min_current_ampere",
                "Must be positive and not above the rated maximum",
            ));
        }

        if self.battery.protection.threshold_watt >= 0.0 {
            return Err(HeliosError::validation(
                "battery.protection.threshold_watt",
                "Must be negative (discharge power)",
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(HeliosError::validation(
                "poll_interval_ms",
                "Must be greater than 0",
            ));
        }

        self.strategy
            .validate()
            .map_err(|e| HeliosError::validation("strategy", e.to_string()))?;

        Ok(())
    }
}

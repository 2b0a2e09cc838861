//! Charging strategies and the pure surplus arithmetic behind them
//!
//! Everything here is free of I/O: given a power-flow sample and the charger
//! limits, compute the surplus a strategy sees and the current it would ask
//! the charging station for. The controller owns timing and side effects.

use crate::config::ChargerConfig;
use crate::error::{HeliosError, Result};
use crate::meter::PowerSample;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Share of the battery-priority surplus handed to the vehicle
const BATTERY_PRIO_SURPLUS_FACTOR: f64 = 0.90;

/// Charging strategy selected by the user or a digital-input override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargingStrategy {
    /// No active management
    #[default]
    Off,

    /// Charge from surplus only after the home battery has been served
    SurplusBatteryPrio,

    /// Charge from surplus ahead of the home battery
    SurplusVehiclePrio,

    /// Full rated current, home battery may discharge into the vehicle
    MaxWithBattery,

    /// Full rated current, home battery discharge locked
    MaxWithoutBattery,
}

impl ChargingStrategy {
    /// All strategies in their canonical order
    pub const ALL: [ChargingStrategy; 5] = [
        ChargingStrategy::Off,
        ChargingStrategy::SurplusBatteryPrio,
        ChargingStrategy::SurplusVehiclePrio,
        ChargingStrategy::MaxWithBattery,
        ChargingStrategy::MaxWithoutBattery,
    ];

    /// Hysteresis-gated strategies driven by computed surplus
    pub fn is_surplus(self) -> bool {
        matches!(
            self,
            ChargingStrategy::SurplusBatteryPrio | ChargingStrategy::SurplusVehiclePrio
        )
    }

    /// Strategies that charge at the rated maximum regardless of surplus
    pub fn is_max_power(self) -> bool {
        matches!(
            self,
            ChargingStrategy::MaxWithBattery | ChargingStrategy::MaxWithoutBattery
        )
    }

    /// Whether the home battery must be prevented from discharging
    pub fn locks_battery_discharge(self) -> bool {
        self == ChargingStrategy::MaxWithoutBattery
    }

    /// Stable wire/storage name
    pub fn as_str(self) -> &'static str {
        match self {
            ChargingStrategy::Off => "off",
            ChargingStrategy::SurplusBatteryPrio => "surplus_battery_prio",
            ChargingStrategy::SurplusVehiclePrio => "surplus_vehicle_prio",
            ChargingStrategy::MaxWithBattery => "max_with_battery",
            ChargingStrategy::MaxWithoutBattery => "max_without_battery",
        }
    }
}

impl fmt::Display for ChargingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChargingStrategy {
    type Err = HeliosError;

    fn from_str(s: &str) -> Result<Self> {
        ChargingStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s.trim())
            .ok_or_else(|| {
                HeliosError::validation("strategy", format!("unknown charging strategy: {}", s))
            })
    }
}

fn default_phase_switch() -> u8 {
    3
}

fn default_input_strategy() -> ChargingStrategy {
    ChargingStrategy::MaxWithoutBattery
}

/// User-editable strategy settings, stored by the persistence collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingStrategyConfig {
    /// Strategy the controller runs
    pub active_strategy: ChargingStrategy,

    /// Surplus required before a surplus strategy starts charging
    pub min_start_power_watt: f64,

    /// Surplus below which an active surplus strategy begins its stop delay
    pub stop_threshold_watt: f64,

    /// Seconds the start condition must hold continuously
    pub start_delay_seconds: u64,

    /// Seconds the stop condition must hold continuously
    pub stop_delay_seconds: u64,

    /// Phases physically wired to the charger (1 or 3)
    #[serde(default = "default_phase_switch")]
    pub physical_phase_switch: u8,

    /// Smallest current change worth sending to the charger
    pub min_current_change_ampere: u32,

    /// Minimum seconds between two current adjustments
    pub min_change_interval_seconds: u64,

    /// Strategy activated by a rising edge on the charger's digital input
    #[serde(default = "default_input_strategy")]
    pub input_x1_strategy: ChargingStrategy,
}

impl Default for ChargingStrategyConfig {
    fn default() -> Self {
        Self {
            active_strategy: ChargingStrategy::Off,
            min_start_power_watt: 1400.0,
            stop_threshold_watt: 1000.0,
            start_delay_seconds: 120,
            stop_delay_seconds: 300,
            physical_phase_switch: 3,
            min_current_change_ampere: 1,
            min_change_interval_seconds: 30,
            input_x1_strategy: ChargingStrategy::MaxWithoutBattery,
        }
    }
}

impl ChargingStrategyConfig {
    /// Decode and validate a stored settings document.
    ///
    /// Any failure is reported as [`HeliosError::ConfigInvalid`] so a cycle can
    /// abort instead of running with silently substituted defaults.
    pub fn from_stored(value: &serde_json::Value) -> Result<Self> {
        let config: ChargingStrategyConfig = serde_json::from_value(value.clone())
            .map_err(|e| HeliosError::config_invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.physical_phase_switch, 1 | 3) {
            return Err(HeliosError::config_invalid(format!(
                "physical_phase_switch must be 1 or 3, got {}",
                self.physical_phase_switch
            )));
        }
        if !self.min_start_power_watt.is_finite() || self.min_start_power_watt <= 0.0 {
            return Err(HeliosError::config_invalid(
                "min_start_power_watt must be a positive number",
            ));
        }
        if !self.stop_threshold_watt.is_finite() || self.stop_threshold_watt < 0.0 {
            return Err(HeliosError::config_invalid(
                "stop_threshold_watt must not be negative",
            ));
        }
        if self.min_current_change_ampere == 0 {
            return Err(HeliosError::config_invalid(
                "min_current_change_ampere must be at least 1",
            ));
        }
        if self.input_x1_strategy == ChargingStrategy::Off {
            return Err(HeliosError::config_invalid(
                "input_x1_strategy cannot be off",
            ));
        }
        Ok(())
    }
}

/// Result of the target-current derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentTarget {
    /// Charge at this many amperes per phase
    Charge(u32),

    /// Surplus does not cover the minimum charging current
    Insufficient,
}

impl CurrentTarget {
    pub fn ampere(self) -> Option<u32> {
        match self {
            CurrentTarget::Charge(a) => Some(a),
            CurrentTarget::Insufficient => None,
        }
    }
}

/// House consumption without the charger's own draw.
///
/// The meter reports house and charger combined.
pub fn house_only_power(sample: &PowerSample) -> f64 {
    (sample.house_power - sample.wallbox_power.max(0.0)).max(0.0)
}

/// Power available for EV charging under `strategy`
pub fn calculate_surplus(strategy: ChargingStrategy, sample: &PowerSample) -> f64 {
    let pv = sample.pv_power;
    let house = house_only_power(sample);
    let battery = sample.battery_power;

    let surplus = match strategy {
        ChargingStrategy::Off => 0.0,
        ChargingStrategy::SurplusBatteryPrio => {
            ((pv - house) - battery.max(0.0)) * BATTERY_PRIO_SURPLUS_FACTOR
        }
        // Discharge power counts towards the vehicle; the derate in the
        // controller keeps this from draining the battery for long.
        ChargingStrategy::SurplusVehiclePrio => pv - house - battery.min(0.0),
        ChargingStrategy::MaxWithBattery => pv + battery.min(0.0).abs() - house,
        ChargingStrategy::MaxWithoutBattery => pv - house,
    };
    surplus.max(0.0)
}

/// Power the charger draws at the minimum current on `phases` phases
pub fn min_charging_power(phases: u8, charger: &ChargerConfig) -> f64 {
    charger.nominal_voltage * f64::from(phases) * f64::from(charger.min_current_ampere)
}

/// Rated maximum for the phase layout, capped by the station's hardware limit
pub fn rated_max_current(phases: u8, charger: &ChargerConfig, hardware_max: Option<u32>) -> u32 {
    let rated = if phases == 1 {
        charger.max_current_single_phase
    } else {
        charger.max_current_three_phase
    };
    match hardware_max {
        Some(max) if max >= charger.min_current_ampere => rated.min(max),
        _ => rated,
    }
}

/// Current the strategy wants for the given surplus
pub fn target_current(
    strategy: ChargingStrategy,
    surplus: f64,
    phases: u8,
    charger: &ChargerConfig,
    hardware_max: Option<u32>,
) -> CurrentTarget {
    let max = rated_max_current(phases, charger, hardware_max);
    if strategy.is_max_power() {
        return CurrentTarget::Charge(max);
    }
    if !strategy.is_surplus() || surplus < min_charging_power(phases, charger) {
        return CurrentTarget::Insufficient;
    }

    let raw = (surplus / (charger.nominal_voltage * f64::from(phases))).round();
    let ampere = (raw.max(0.0) as u32).clamp(charger.min_current_ampere, max);
    CurrentTarget::Charge(ampere)
}

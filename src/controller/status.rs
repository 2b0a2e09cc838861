use super::{DeviceObservation, StrategyController};
use crate::clock::elapsed_secs;
use crate::context::ChargingContext;
use crate::meter::PowerSample;
use crate::persistence::InterlockRecord;
use crate::protocol::Report1;
use crate::strategy::ChargingStrategyConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Battery discharge protection telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionStatus {
    /// Derate currently applies
    pub active: bool,
    pub discharging_since: Option<DateTime<Utc>>,
    /// Seconds until the derate applies, 0 once active
    pub remaining_seconds: Option<u64>,
    pub threshold_watt: f64,
    pub duration_seconds: u64,
    pub derate_ampere: u32,
}

/// Snapshot for status endpoints and logs
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub context: ChargingContext,
    pub settings: Option<ChargingStrategyConfig>,
    /// Why `settings` is missing
    pub settings_error: Option<String>,
    pub protection: ProtectionStatus,
    pub device: Option<DeviceObservation>,
    /// Product, serial and firmware read at startup
    pub device_info: Option<Report1>,
    pub last_sample: Option<PowerSample>,
    pub last_interlock: Option<InterlockRecord>,
    pub battery_integration: bool,
}

impl StrategyController {
    pub fn get_status(&self) -> ControllerStatus {
        let now = self.clock.now();
        let (settings, settings_error) = match self.load_settings() {
            Ok(settings) => (Some(settings), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let control = self.store.get_control_state().unwrap_or_else(|e| {
            self.logger
                .warn(&format!("Control state unavailable: {}", e));
            Default::default()
        });

        let protection = &self.battery.protection;
        let since = control.battery_discharge_since;
        let elapsed = since.map(|since| elapsed_secs(since, now) as u64);
        let active = elapsed.is_some_and(|e| e > protection.duration_seconds);

        ControllerStatus {
            context: self.context.clone(),
            settings,
            settings_error,
            protection: ProtectionStatus {
                active,
                discharging_since: since,
                remaining_seconds: elapsed
                    .map(|e| (protection.duration_seconds + 1).saturating_sub(e)),
                threshold_watt: protection.threshold_watt,
                duration_seconds: protection.duration_seconds,
                derate_ampere: protection.derate_ampere,
            },
            device: self.last_observation.clone(),
            device_info: self.device_info.clone(),
            last_sample: self.last_sample.clone(),
            last_interlock: control.last_interlock,
            battery_integration: self.battery.enabled,
        }
    }
}

//! Charging strategy controller
//!
//! Owns the [`ChargingContext`] and is the only writer to it. Each evaluation
//! cycle reconciles the context with the station, computes the surplus for the
//! active strategy, runs start/stop hysteresis and sends the resulting enable
//! and current commands. Strategy switches additionally drive the battery
//! interlock.
//!
//! The controller is not internally synchronized; callers share it behind a
//! single `tokio::sync::Mutex` so evaluations never overlap.

use crate::clock::Clock;
use crate::config::{BatteryConfig, ChargerConfig};
use crate::context::{ChargingContext, Phases};
use crate::error::{HeliosError, Result};
use crate::interlock::BatteryInterlock;
use crate::logging::{StructuredLogger, get_logger};
use crate::meter::PowerSample;
use crate::persistence::{LogEntry, LogSeverity, StateStore};
use crate::protocol::Report1;
use crate::strategy::ChargingStrategyConfig;
use crate::transport::DeviceLink;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

mod commands;
mod cycle;
mod reconcile;
mod status;
mod switch;


pub use status::{ControllerStatus, ProtectionStatus};

/// What a single evaluation cycle ended up doing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A device round trip failed; nothing changed
    Abandoned { reason: String },
    /// Strategy is off and charging is inactive
    Off,
    /// Not enough surplus to charge
    Insufficient,
    /// Surplus is high enough but the start delay is still running
    WaitingToStart { elapsed_seconds: i64, required_seconds: u64 },
    Started { ampere: u32 },
    Adjusted { from: u32, to: u32 },
    /// Charging continues at the current setting
    Holding { ampere: u32 },
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    StrategyOff,
    SurplusBelowThreshold,
    StrategySwitch,
    ExternalOverride,
}

impl StopReason {
    fn describe(self) -> &'static str {
        match self {
            StopReason::StrategyOff => "strategy is off",
            StopReason::SurplusBelowThreshold => "surplus stayed below the stop threshold",
            StopReason::StrategySwitch => "strategy switch",
            StopReason::ExternalOverride => "digital input released",
        }
    }
}

/// Device state seen during the last reconciliation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceObservation {
    /// State is charging and measured power exceeds the floor
    pub charging: bool,
    pub phases: Phases,
    pub power_watt: f64,
    pub state: u8,
    pub plug: u8,
    pub input: u8,
    pub enable_sys: bool,
    /// Installer hardware limit in whole amperes, if reported
    pub hardware_max_ampere: Option<u32>,
    /// Current the station signals to the vehicle, in whole amperes
    pub signalled_ampere: u32,
    /// Highest per-phase current in whole amperes
    pub measured_ampere: u32,
    pub observed_at: DateTime<Utc>,
}

pub struct StrategyController {
    device: Arc<dyn DeviceLink>,
    interlock: Arc<dyn BatteryInterlock>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    charger: ChargerConfig,
    battery: BatteryConfig,
    context: ChargingContext,
    last_sample: Option<PowerSample>,
    last_observation: Option<DeviceObservation>,
    device_info: Option<Report1>,
    logger: StructuredLogger,
}

impl StrategyController {
    /// Build a controller around its collaborators, restoring the stored context
    pub fn new(
        device: Arc<dyn DeviceLink>,
        interlock: Arc<dyn BatteryInterlock>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        charger: ChargerConfig,
        battery: BatteryConfig,
    ) -> Result<Self> {
        let logger = get_logger("controller");
        let mut context = store.get_context()?;
        if !context.is_consistent() {
            logger.warn("Stored charging context is inconsistent, resetting control fields");
            if !context.is_active {
                context.mark_stopped();
            }
            context.clear_hysteresis();
        }
        logger.info(&format!(
            "Restored context: strategy={} active={} current={}A",
            context.strategy, context.is_active, context.current_ampere
        ));

        Ok(Self {
            device,
            interlock,
            store,
            clock,
            charger,
            battery,
            context,
            last_sample: None,
            last_observation: None,
            device_info: None,
            logger,
        })
    }

    /// Store `defaults` as the strategy settings unless settings already exist
    pub fn seed_settings(&self, defaults: &ChargingStrategyConfig) -> Result<()> {
        if self.store.get_settings()?.is_none() {
            defaults.validate()?;
            self.store.save_settings(&serde_json::to_value(defaults)?)?;
            self.logger.info("Seeded strategy settings from configuration");
        }
        Ok(())
    }

    pub fn context(&self) -> &ChargingContext {
        &self.context
    }

    pub fn last_observation(&self) -> Option<&DeviceObservation> {
        self.last_observation.as_ref()
    }

    /// Stored strategy settings, validated
    pub fn load_settings(&self) -> Result<ChargingStrategyConfig> {
        let stored = self
            .store
            .get_settings()?
            .ok_or_else(|| HeliosError::config_invalid("no strategy settings stored"))?;
        ChargingStrategyConfig::from_stored(&stored)
    }

    /// Validate and store new strategy settings, then bring the interlock in
    /// line with the configured strategy. The interlock runs first so a
    /// failed lock leaves the old settings in place.
    pub async fn save_settings(&mut self, settings: &ChargingStrategyConfig) -> Result<()> {
        settings.validate()?;
        self.handle_strategy_change(settings.active_strategy).await?;
        self.store.save_settings(&serde_json::to_value(settings)?)?;
        self.record(LogSeverity::Info, "Strategy settings saved");
        Ok(())
    }

    fn persist_context(&self) {
        if let Err(e) = self.store.save_context(&self.context) {
            self.logger
                .error(&format!("Failed to persist charging context: {}", e));
        }
    }

    /// Append to the event log; a full or failing store never blocks control
    fn record<S: Into<String>>(&self, severity: LogSeverity, message: S) {
        let entry = LogEntry::new(self.clock.now(), severity, self.logger.component(), message);
        if let Err(e) = self.store.append_log(entry) {
            self.logger.warn(&format!("Failed to append event log: {}", e));
        }
    }
}

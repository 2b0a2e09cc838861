use super::{CycleOutcome, StopReason, StrategyController};
use crate::clock::elapsed_secs;
use crate::error::{HeliosError, Result};
use crate::meter::PowerSample;
use crate::strategy::{
    ChargingStrategy, ChargingStrategyConfig, CurrentTarget, calculate_surplus, target_current,
};
use chrono::{DateTime, Utc};

impl StrategyController {
    /// Run one evaluation cycle against `sample`.
    ///
    /// Device round-trip failures are logged and reported as
    /// [`CycleOutcome::Abandoned`]; the next cycle simply tries again. A
    /// missing device address or invalid stored settings are returned as
    /// errors.
    pub async fn process_strategy(
        &mut self,
        sample: PowerSample,
        address: &str,
    ) -> Result<CycleOutcome> {
        let address = address.trim();
        if address.is_empty() {
            return Err(HeliosError::DeviceNotConfigured);
        }
        let settings = self.load_settings().inspect_err(|e| {
            self.logger.error(&format!("Cycle aborted: {}", e));
        })?;
        self.last_sample = Some(sample.clone());

        if settings.active_strategy != self.context.strategy {
            self.logger.info(&format!(
                "Stored strategy {} replaces {}",
                settings.active_strategy, self.context.strategy
            ));
            self.context.strategy = settings.active_strategy;
            self.context.clear_hysteresis();
        }

        let observation = match self.observe_device(address).await {
            Ok(observation) => observation,
            Err(e) => return Ok(self.abandon("reconciliation", e)),
        };
        self.reconcile(&observation, &settings);

        let now = self.clock.now();
        let strategy = self.context.strategy;

        if strategy == ChargingStrategy::Off {
            if self.context.is_active {
                return Ok(match self.stop_charging(address, StopReason::StrategyOff).await {
                    Ok(()) => CycleOutcome::Stopped {
                        reason: StopReason::StrategyOff,
                    },
                    Err(e) => self.abandon("stop", e),
                });
            }
            self.context.calculated_surplus = None;
            self.context.clear_hysteresis();
            self.persist_context();
            return Ok(CycleOutcome::Off);
        }

        let surplus = calculate_surplus(strategy, &sample);
        self.context.calculated_surplus = Some(surplus);
        let protected = self.update_discharge_protection(strategy, &sample, now);

        if strategy.is_surplus() && self.context.is_active {
            if surplus < settings.stop_threshold_watt {
                let since = *self.context.below_threshold_since.get_or_insert(now);
                let elapsed = elapsed_secs(since, now);
                if elapsed >= settings.stop_delay_seconds as i64 {
                    return Ok(
                        match self
                            .stop_charging(address, StopReason::SurplusBelowThreshold)
                            .await
                        {
                            Ok(()) => CycleOutcome::Stopped {
                                reason: StopReason::SurplusBelowThreshold,
                            },
                            Err(e) => self.abandon("stop", e),
                        },
                    );
                }
                self.logger.debug(&format!(
                    "Surplus {:.0}W below stop threshold for {}s of {}s",
                    surplus, elapsed, settings.stop_delay_seconds
                ));
            } else {
                self.context.below_threshold_since = None;
            }
        }

        let phases = u8::from(self.context.current_phases);
        let hardware_max = observation.hardware_max_ampere;
        let mut target = target_current(strategy, surplus, phases, &self.charger, hardware_max);
        if protected && let CurrentTarget::Charge(ampere) = target {
            let derated = ampere
                .saturating_sub(self.battery.protection.derate_ampere)
                .max(self.charger.min_current_ampere);
            self.logger.debug(&format!(
                "Battery discharge protection: {}A -> {}A",
                ampere, derated
            ));
            target = CurrentTarget::Charge(derated);
        }

        let outcome = match (self.context.is_active, target) {
            // Brief dips are left to the stop hysteresis above
            (true, CurrentTarget::Insufficient) => CycleOutcome::Holding {
                ampere: self.context.current_ampere,
            },
            (false, CurrentTarget::Insufficient) => {
                self.context.start_delay_tracker_since = None;
                CycleOutcome::Insufficient
            }
            (false, CurrentTarget::Charge(ampere)) => {
                return Ok(self
                    .start_check(address, ampere, surplus, &settings, now)
                    .await);
            }
            (true, CurrentTarget::Charge(ampere)) => {
                return Ok(self.adjust_check(address, ampere, &settings, now).await);
            }
        };
        self.persist_context();
        Ok(outcome)
    }

    async fn start_check(
        &mut self,
        address: &str,
        ampere: u32,
        surplus: f64,
        settings: &ChargingStrategyConfig,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let strategy = self.context.strategy;
        if !strategy.is_max_power() {
            if surplus < settings.min_start_power_watt {
                self.context.start_delay_tracker_since = None;
                self.persist_context();
                return CycleOutcome::Insufficient;
            }
            let since = *self.context.start_delay_tracker_since.get_or_insert(now);
            let elapsed = elapsed_secs(since, now);
            if elapsed < settings.start_delay_seconds as i64 {
                self.logger.debug(&format!(
                    "Surplus {:.0}W above start threshold for {}s of {}s",
                    surplus, elapsed, settings.start_delay_seconds
                ));
                self.persist_context();
                return CycleOutcome::WaitingToStart {
                    elapsed_seconds: elapsed,
                    required_seconds: settings.start_delay_seconds,
                };
            }
        }

        match self.start_charging(address, ampere).await {
            Ok(()) => CycleOutcome::Started { ampere },
            Err(e) => self.abandon("start", e),
        }
    }

    async fn adjust_check(
        &mut self,
        address: &str,
        ampere: u32,
        settings: &ChargingStrategyConfig,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let current = self.context.current_ampere;
        let delta = ampere.abs_diff(current);
        let interval_open = self.context.last_adjustment.is_none_or(|last| {
            elapsed_secs(last, now) >= settings.min_change_interval_seconds as i64
        });

        if delta == 0 || delta < settings.min_current_change_ampere || !interval_open {
            self.context.target_ampere = ampere;
            self.persist_context();
            return CycleOutcome::Holding { ampere: current };
        }

        match self.adjust_current(address, ampere).await {
            Ok(()) => CycleOutcome::Adjusted {
                from: current,
                to: ampere,
            },
            Err(e) => self.abandon("adjust", e),
        }
    }

    /// Track continuous battery discharge under vehicle priority. Returns
    /// whether the derate applies to this cycle.
    pub(crate) fn update_discharge_protection(
        &mut self,
        strategy: ChargingStrategy,
        sample: &PowerSample,
        now: DateTime<Utc>,
    ) -> bool {
        let protection = &self.battery.protection;
        let discharging = strategy == ChargingStrategy::SurplusVehiclePrio
            && sample.battery_power < protection.threshold_watt;

        let mut since = None;
        let result = self.store.update_control_state(&mut |control| {
            if discharging {
                since = Some(*control.battery_discharge_since.get_or_insert(now));
            } else {
                control.battery_discharge_since = None;
            }
        });
        if let Err(e) = result {
            self.logger
                .warn(&format!("Discharge protection state unavailable: {}", e));
            return false;
        }

        since.is_some_and(|since| elapsed_secs(since, now) > protection.duration_seconds as i64)
    }

    fn abandon(&self, step: &str, error: HeliosError) -> CycleOutcome {
        self.logger
            .warn(&format!("Cycle abandoned during {}: {}", step, error));
        CycleOutcome::Abandoned {
            reason: error.to_string(),
        }
    }
}

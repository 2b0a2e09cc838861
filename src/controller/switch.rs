use super::{StopReason, StrategyController};
use crate::error::Result;
use crate::interlock::{InterlockAction, InterlockOutcome};
use crate::persistence::{InterlockRecord, LogSeverity};
use crate::strategy::ChargingStrategy;

impl StrategyController {
    /// Switch to `strategy`.
    ///
    /// Stops an active session, moves the battery interlock if the switch
    /// enters or leaves `max_without_battery`, persists the new strategy and
    /// clears pending start/stop intent. Surplus strategies are evaluated
    /// again right away with the last sample; max-power strategies start on the
    /// next cycle. Interlock failures are returned before anything is
    /// persisted.
    pub async fn switch_strategy(&mut self, strategy: ChargingStrategy, address: &str) -> Result<()> {
        let previous = self.context.strategy;
        if strategy == previous {
            self.logger
                .debug(&format!("Strategy already {}, nothing to do", strategy));
            return Ok(());
        }
        self.logger
            .info(&format!("Switching strategy {} -> {}", previous, strategy));

        if self.context.is_active
            && let Err(e) = self.stop_charging(address, StopReason::StrategySwitch).await
        {
            self.logger
                .warn(&format!("Stop before strategy switch failed: {}", e));
        }

        if self.battery.enabled {
            if previous.locks_battery_discharge() && !strategy.locks_battery_discharge() {
                self.run_interlock(InterlockAction::UnlockDischarge).await?;
            }
            if strategy.locks_battery_discharge() {
                self.run_interlock(InterlockAction::LockDischarge).await?;
            }
        }

        self.store_strategy(strategy)?;
        self.context.strategy = strategy;
        self.context.clear_hysteresis();
        self.persist_context();
        self.reset_discharge_protection();
        self.record(
            LogSeverity::Info,
            format!("Strategy switched {} -> {}", previous, strategy),
        );

        if strategy.is_surplus()
            && let Some(sample) = self.last_sample.clone()
        {
            match self.process_strategy(sample, address).await {
                Ok(outcome) => self
                    .logger
                    .debug(&format!("Re-evaluation after switch: {:?}", outcome)),
                Err(e) => self
                    .logger
                    .warn(&format!("Re-evaluation after switch failed: {}", e)),
            }
        }
        Ok(())
    }

    /// Bring the battery interlock in line with `strategy`: discharge is
    /// locked for `max_without_battery` and unlocked for everything else.
    /// Errors are returned to the caller.
    pub async fn handle_strategy_change(&mut self, strategy: ChargingStrategy) -> Result<()> {
        if !self.battery.enabled {
            return Ok(());
        }
        let action = if strategy.locks_battery_discharge() {
            InterlockAction::LockDischarge
        } else {
            InterlockAction::UnlockDischarge
        };
        self.run_interlock(action).await.map(|_| ())
    }

    /// Allow or forbid charging the home battery from the grid
    pub async fn set_grid_charging(&mut self, enabled: bool) -> Result<()> {
        if !self.battery.enabled {
            return Ok(());
        }
        let action = if enabled {
            InterlockAction::EnableGridCharge
        } else {
            InterlockAction::DisableGridCharge
        };
        self.run_interlock(action).await.map(|_| ())
    }

    /// Persist `strategy` as the intended strategy. Never fails: this is the
    /// last step after an override whose side effects may have failed, and
    /// the stored strategy must follow the physical input regardless.
    pub fn commit_strategy_intent(&mut self, strategy: ChargingStrategy) {
        if let Err(e) = self.store_strategy(strategy) {
            self.logger
                .error(&format!("Failed to store strategy {}: {}", strategy, e));
        }
        if self.context.strategy != strategy {
            self.context.strategy = strategy;
            self.context.clear_hysteresis();
        }
        self.persist_context();
    }

    fn store_strategy(&self, strategy: ChargingStrategy) -> Result<()> {
        let mut settings = self.load_settings()?;
        settings.active_strategy = strategy;
        self.store.save_settings(&serde_json::to_value(&settings)?)
    }

    fn reset_discharge_protection(&self) {
        if let Err(e) = self
            .store
            .update_control_state(&mut |control| control.battery_discharge_since = None)
        {
            self.logger
                .warn(&format!("Failed to reset discharge protection: {}", e));
        }
    }

    async fn run_interlock(&mut self, action: InterlockAction) -> Result<InterlockOutcome> {
        let result = self.interlock.execute(action).await;
        let record = InterlockRecord {
            action,
            at: self.clock.now(),
            succeeded: result.is_ok(),
        };
        if let Err(e) = self
            .store
            .update_control_state(&mut |control| control.last_interlock = Some(record.clone()))
        {
            self.logger
                .warn(&format!("Failed to record interlock state: {}", e));
        }
        match &result {
            Ok(InterlockOutcome::Executed { .. }) => {
                self.record(LogSeverity::Info, format!("Battery interlock: {}", action))
            }
            Ok(InterlockOutcome::Skipped) => {}
            Err(e) => self.record(
                LogSeverity::Error,
                format!("Battery interlock {} failed: {}", action, e),
            ),
        }
        result
    }
}

use super::{StopReason, StrategyController};
use crate::error::Result;
use crate::persistence::LogSeverity;
use crate::protocol::DeviceCommand;

impl StrategyController {
    /// Enable charging at `ampere`. The context changes only once both
    /// commands are acknowledged.
    pub(crate) async fn start_charging(&mut self, address: &str, ampere: u32) -> Result<()> {
        self.device
            .request(address, DeviceCommand::Enable(true))
            .await?;
        self.device
            .request(address, DeviceCommand::current_ampere(ampere))
            .await?;

        self.context.mark_started(ampere, self.clock.now());
        self.persist_context();
        let message = format!(
            "Charging started at {}A ({}, {} phase)",
            ampere,
            self.context.strategy,
            self.context.current_phases.count()
        );
        self.logger.info(&message);
        self.record(LogSeverity::Info, message);
        Ok(())
    }

    pub(crate) async fn stop_charging(&mut self, address: &str, reason: StopReason) -> Result<()> {
        self.device
            .request(address, DeviceCommand::Enable(false))
            .await?;

        self.context.mark_stopped();
        self.persist_context();
        let message = format!("Charging stopped: {}", reason.describe());
        self.logger.info(&message);
        self.record(LogSeverity::Info, message);
        Ok(())
    }

    pub(crate) async fn adjust_current(&mut self, address: &str, ampere: u32) -> Result<()> {
        let from = self.context.current_ampere;
        self.device
            .request(address, DeviceCommand::current_ampere(ampere))
            .await?;

        self.context.mark_adjusted(ampere, self.clock.now());
        self.persist_context();
        let message = format!("Charging current {}A -> {}A", from, ampere);
        self.logger.info(&message);
        self.record(LogSeverity::Info, message);
        Ok(())
    }

    /// Disable charging whatever the context believes
    pub async fn force_stop(&mut self, address: &str) -> Result<()> {
        self.stop_charging(address, StopReason::ExternalOverride)
            .await
    }
}

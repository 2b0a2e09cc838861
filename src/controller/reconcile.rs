use super::{DeviceObservation, StrategyController};
use crate::context::Phases;
use crate::error::{HeliosError, Result};
use crate::persistence::LogSeverity;
use crate::protocol::{DeviceCommand, Report1, Report2, Report3, ReportId, Response};
use crate::strategy::ChargingStrategyConfig;

fn report_fields(response: Response, id: ReportId) -> Result<crate::protocol::Fields> {
    match response {
        Response::Report { fields, .. } => Ok(fields),
        other => Err(HeliosError::protocol_mismatch(format!(
            "expected report {}, got {:?}",
            id.number(),
            other
        ))),
    }
}

impl StrategyController {
    /// Read report 1 and keep the station identity for status output
    pub async fn identify_device(&mut self, address: &str) -> Result<Report1> {
        let address = address.trim();
        if address.is_empty() {
            return Err(HeliosError::DeviceNotConfigured);
        }
        let info = self
            .device
            .request(address, DeviceCommand::Report(ReportId::Info))
            .await?;
        let info = Report1::from_fields(&report_fields(info, ReportId::Info)?)?;
        self.logger.info(&format!(
            "Charging station {} serial {} firmware {}",
            info.product, info.serial, info.firmware
        ));
        self.device_info = Some(info.clone());
        Ok(info)
    }

    /// Read reports 2 and 3 and condense them into an observation
    pub(crate) async fn observe_device(&mut self, address: &str) -> Result<DeviceObservation> {
        let status = self
            .device
            .request(address, DeviceCommand::Report(ReportId::Status))
            .await?;
        let status = Report2::from_fields(&report_fields(status, ReportId::Status)?)?;

        let metering = self
            .device
            .request(address, DeviceCommand::Report(ReportId::Metering))
            .await?;
        let metering = Report3::from_fields(&report_fields(metering, ReportId::Metering)?)?;

        let power_watt = metering.power_watt();
        let threshold = self.charger.active_phase_current_ma;
        let observation = DeviceObservation {
            charging: status.is_charging() && power_watt > self.charger.charging_power_floor_watt,
            phases: Phases::from_active_count(metering.active_phases(threshold)),
            power_watt,
            state: status.state,
            plug: status.plug,
            input: status.input,
            enable_sys: status.enable_sys,
            hardware_max_ampere: status.curr_hw_ma.map(|ma| ma / 1000),
            signalled_ampere: status.max_curr_ma / 1000,
            measured_ampere: metering.currents_ma.iter().copied().max().unwrap_or(0) / 1000,
            observed_at: self.clock.now(),
        };
        self.logger.trace(&format!(
            "Device: state={} plug={} power={:.0}W phases={}",
            observation.state,
            observation.plug,
            observation.power_watt,
            observation.phases.count()
        ));
        self.last_observation = Some(observation.clone());
        Ok(observation)
    }

    /// Correct the context where the device disagrees with it. Returns whether
    /// anything changed.
    pub(crate) fn reconcile(
        &mut self,
        observation: &DeviceObservation,
        settings: &ChargingStrategyConfig,
    ) -> bool {
        let mut changed = false;

        // Idle stations draw no current, so phases come from the installed switch
        let phases = if observation.charging {
            observation.phases
        } else {
            Phases::try_from(settings.physical_phase_switch).unwrap_or_default()
        };
        if self.context.current_phases != phases {
            self.logger.info(&format!(
                "Phase layout {} -> {}",
                self.context.current_phases.count(),
                phases.count()
            ));
            self.context.current_phases = phases;
            changed = true;
        }

        if self.context.is_active != observation.charging {
            let message = if observation.charging {
                let ampere = observation
                    .measured_ampere
                    .max(self.charger.min_current_ampere);
                self.context.mark_started(ampere, observation.observed_at);
                format!("Station is charging at ~{}A although context was idle; adopting", ampere)
            } else {
                self.context.mark_stopped();
                format!(
                    "Station is not charging (state {}, {:.0}W) although context was active; resetting",
                    observation.state, observation.power_watt
                )
            };
            self.logger.warn(&message);
            self.record(LogSeverity::Warn, message);
            changed = true;
        }

        if changed {
            self.persist_context();
        }
        changed
    }
}

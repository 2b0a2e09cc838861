#![allow(dead_code)]

use async_trait::async_trait;
use helios::clock::{Clock, ManualClock};
use helios::config::{BatteryConfig, ChargerConfig};
use helios::controller::StrategyController;
use helios::error::{HeliosError, Result};
use helios::interlock::{BatteryInterlock, InterlockAction, InterlockOutcome};
use helios::meter::PowerSample;
use helios::persistence::MemoryStateStore;
use helios::protocol::{DeviceCommand, ReportId, Response, decode};
use helios::strategy::ChargingStrategyConfig;
use helios::transport::DeviceLink;
use std::sync::{Arc, Mutex};

pub const ADDRESS: &str = "192.168.1.50";

#[derive(Default)]
struct StationState {
    enabled: bool,
    current_ma: u32,
    phases: u32,
    fail_commands: bool,
    hardware_limit_ma: Option<u32>,
    sent: Vec<String>,
}

/// In-process charging station: acknowledges `ena`/`curr` and reports
/// charging once enabled with at least 6A.
pub struct SimulatedStation {
    state: Mutex<StationState>,
}

impl SimulatedStation {
    pub fn new(phases: u32) -> Self {
        Self {
            state: Mutex::new(StationState {
                phases,
                ..StationState::default()
            }),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn count(&self, wire: &str) -> usize {
        self.sent().iter().filter(|c| c.as_str() == wire).count()
    }

    /// Commands other than report requests
    pub fn control_commands(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|c| !c.starts_with("report"))
            .collect()
    }

    /// Make `ena`/`curr` time out while reports still answer
    pub fn fail_commands(&self, fail: bool) {
        self.state.lock().unwrap().fail_commands = fail;
    }

    /// Report an installer hardware limit in report 2
    pub fn set_hardware_limit(&self, ampere: u32) {
        self.state.lock().unwrap().hardware_limit_ma = Some(ampere * 1000);
    }

    /// Pretend someone else enabled the station
    pub fn force_charging(&self, ampere: u32) {
        let mut s = self.state.lock().unwrap();
        s.enabled = true;
        s.current_ma = ampere * 1000;
    }
}

#[async_trait]
impl DeviceLink for SimulatedStation {
    async fn request(&self, _address: &str, command: DeviceCommand) -> Result<Response> {
        let mut s = self.state.lock().unwrap();
        s.sent.push(command.to_wire());
        let charging = s.enabled && s.current_ma >= 6000;
        let raw = match command {
            DeviceCommand::Enable(_) | DeviceCommand::Current(_) if s.fail_commands => {
                return Err(HeliosError::transport_timeout("no answer"));
            }
            DeviceCommand::Enable(on) => {
                s.enabled = on;
                "TCH-OK :done".to_string()
            }
            DeviceCommand::Current(ma) => {
                s.current_ma = ma;
                "TCH-OK :done".to_string()
            }
            DeviceCommand::Report(ReportId::Status) => {
                let hardware = s
                    .hardware_limit_ma
                    .map(|ma| format!(r#", "Curr HW": {}"#, ma))
                    .unwrap_or_default();
                format!(
                    r#"{{"ID": "2", "State": {}, "Plug": 7, "Enable sys": {}, "Max curr": {}, "Input": 0{}}}"#,
                    if charging { 3 } else { 2 },
                    u8::from(s.enabled),
                    s.current_ma,
                    hardware
                )
            }
            DeviceCommand::Report(ReportId::Metering) => {
                let per_phase = if charging { s.current_ma } else { 0 };
                let phase = |n: u32| if n < s.phases { per_phase } else { 0 };
                format!(
                    "Report: ID=3;U1=230;U2=230;U3=230;I1={};I2={};I3={};P={};E pres=0;E total=0",
                    phase(0),
                    phase(1),
                    phase(2),
                    230 * per_phase as u64 * s.phases as u64
                )
            }
            DeviceCommand::Report(ReportId::Info) => {
                r#"{"ID": "1", "Product": "KC-P30", "Serial": "22334455", "Firmware": "P30 v 3.10"}"#
                    .to_string()
            }
        };
        Ok(decode(raw.as_bytes()))
    }
}

#[derive(Default)]
pub struct RecordingInterlock {
    actions: Mutex<Vec<InterlockAction>>,
    fail: Mutex<bool>,
}

impl RecordingInterlock {
    pub fn actions(&self) -> Vec<InterlockAction> {
        self.actions.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl BatteryInterlock for RecordingInterlock {
    async fn execute(&self, action: InterlockAction) -> Result<InterlockOutcome> {
        self.actions.lock().unwrap().push(action);
        if *self.fail.lock().unwrap() {
            return Err(HeliosError::interlock_failed("battery system unreachable"));
        }
        Ok(InterlockOutcome::Executed {
            output: "ok".to_string(),
        })
    }
}

pub struct Rig {
    pub controller: StrategyController,
    pub station: Arc<SimulatedStation>,
    pub interlock: Arc<RecordingInterlock>,
    pub store: Arc<MemoryStateStore>,
    pub clock: Arc<ManualClock>,
}

pub fn rig(settings: ChargingStrategyConfig, battery_enabled: bool) -> Rig {
    let station = Arc::new(SimulatedStation::new(u32::from(settings.physical_phase_switch)));
    let interlock = Arc::new(RecordingInterlock::default());
    let store = Arc::new(MemoryStateStore::default());
    let clock = Arc::new(ManualClock::default());
    let battery = BatteryConfig {
        enabled: battery_enabled,
        ..BatteryConfig::default()
    };
    let controller = StrategyController::new(
        station.clone(),
        interlock.clone(),
        store.clone(),
        clock.clone(),
        ChargerConfig::default(),
        battery,
    )
    .unwrap();
    controller.seed_settings(&settings).unwrap();
    Rig {
        controller,
        station,
        interlock,
        store,
        clock,
    }
}

pub fn sample(clock: &ManualClock, pv: f64, house: f64, battery: f64, wallbox: f64) -> PowerSample {
    PowerSample {
        pv_power: pv,
        battery_power: battery,
        house_power: house,
        grid_power: 0.0,
        battery_soc: 60.0,
        wallbox_power: wallbox,
        timestamp: clock.now(),
    }
}

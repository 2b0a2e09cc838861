mod common;

use async_trait::async_trait;
use chrono::Utc;
use common::{ADDRESS, rig};
use helios::controller::CycleOutcome;
use helios::error::{HeliosError, Result};
use helios::meter::{EnergyMeter, LiveData};
use helios::runtime::Runtime;
use helios::strategy::{ChargingStrategy, ChargingStrategyConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct StaticMeter {
    live: Mutex<Option<LiveData>>,
}

impl StaticMeter {
    fn with(pv: f64, house: f64) -> Self {
        Self {
            live: Mutex::new(Some(LiveData {
                pv_power: pv,
                battery_power: 0.0,
                battery_soc: 80.0,
                house_power: house,
                grid_power: 0.0,
                autarky: 0.0,
                self_consumption: 0.0,
                timestamp: Utc::now(),
            })),
        }
    }
}

#[async_trait]
impl EnergyMeter for StaticMeter {
    async fn read_live_data(&self, _charger_power_w: f64) -> Result<LiveData> {
        self.live
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| HeliosError::meter("exporter offline"))
    }
}

fn settings(strategy: ChargingStrategy) -> ChargingStrategyConfig {
    ChargingStrategyConfig {
        active_strategy: strategy,
        ..ChargingStrategyConfig::default()
    }
}

#[tokio::test]
async fn evaluate_now_runs_one_cycle() {
    let r = rig(settings(ChargingStrategy::MaxWithBattery), false);
    let station = r.station.clone();
    let controller = Arc::new(tokio::sync::Mutex::new(r.controller));
    let (mut runtime, _handle) = Runtime::new(
        controller,
        Arc::new(StaticMeter::with(0.0, 400.0)),
        ADDRESS,
        15_000,
    );

    let outcome = runtime.evaluate_now().await;
    assert_eq!(outcome, Some(CycleOutcome::Started { ampere: 16 }));
    assert_eq!(runtime.stats().cycles, 1);
    assert_eq!(station.control_commands(), vec!["ena 1", "curr 16000"]);
}

#[tokio::test]
async fn missing_live_data_skips_the_cycle() {
    let r = rig(settings(ChargingStrategy::MaxWithBattery), false);
    let station = r.station.clone();
    let controller = Arc::new(tokio::sync::Mutex::new(r.controller));
    let (mut runtime, _handle) =
        Runtime::new(controller, Arc::new(StaticMeter::default()), ADDRESS, 15_000);

    assert_eq!(runtime.evaluate_now().await, None);
    assert_eq!(runtime.stats().cycles, 0);
    assert!(station.sent().is_empty());
}

#[tokio::test]
async fn trigger_forces_an_extra_cycle_and_shutdown_stops_the_loop() {
    let r = rig(settings(ChargingStrategy::Off), false);
    let station = r.station.clone();
    let controller = Arc::new(tokio::sync::Mutex::new(r.controller));
    let (mut runtime, handle) = Runtime::new(
        controller,
        Arc::new(StaticMeter::with(3000.0, 500.0)),
        ADDRESS,
        60_000,
    );
    let task = tokio::spawn(async move {
        runtime.run().await;
        runtime.stats()
    });

    let wait_for_reports = |n: usize| {
        let station = station.clone();
        async move {
            while station.count("report 2") < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    };

    // The first tick fires immediately
    tokio::time::timeout(Duration::from_secs(2), wait_for_reports(1))
        .await
        .unwrap();
    handle.trigger_sender().try_send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), wait_for_reports(2))
        .await
        .unwrap();

    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.skipped_ticks, 0);
}

#[tokio::test]
async fn ticks_are_skipped_while_the_controller_is_busy() {
    let r = rig(settings(ChargingStrategy::Off), false);
    let station = r.station.clone();
    let controller = Arc::new(tokio::sync::Mutex::new(r.controller));
    let (mut runtime, handle) = Runtime::new(
        controller.clone(),
        Arc::new(StaticMeter::with(3000.0, 500.0)),
        ADDRESS,
        50,
    );
    let task = tokio::spawn(async move {
        runtime.run().await;
        runtime.stats()
    });

    let reports_reach = |n: usize| {
        let station = station.clone();
        async move {
            while station.count("report 2") < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), reports_reach(1))
        .await
        .unwrap();

    let busy = controller.lock().await;
    let before = station.count("report 2");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(station.count("report 2"), before);
    drop(busy);

    tokio::time::timeout(Duration::from_secs(2), reports_reach(before + 1))
        .await
        .unwrap();

    handle.shutdown();
    let stats = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    assert!(stats.skipped_ticks > 0);
    assert!(stats.cycles as usize > before);
}

mod common;

use common::{ADDRESS, Rig, rig, sample};
use helios::clock::ManualClock;
use helios::controller::StrategyController;
use helios::interlock::InterlockAction;
use helios::listener::BroadcastListener;
use helios::persistence::{MemoryStateStore, StateStore};
use helios::protocol::{BroadcastEvent, decode};
use helios::strategy::{ChargingStrategy, ChargingStrategyConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};

struct Setup {
    listener: BroadcastListener,
    controller: Arc<Mutex<StrategyController>>,
    trigger_rx: mpsc::Receiver<()>,
    station: Arc<common::SimulatedStation>,
    interlock: Arc<common::RecordingInterlock>,
    store: Arc<MemoryStateStore>,
    clock: Arc<ManualClock>,
}

fn setup(strategy: ChargingStrategy) -> Setup {
    let settings = ChargingStrategyConfig {
        active_strategy: strategy,
        start_delay_seconds: 0,
        ..ChargingStrategyConfig::default()
    };
    let Rig {
        controller,
        station,
        interlock,
        store,
        clock,
    } = rig(settings, true);
    let controller = Arc::new(Mutex::new(controller));
    let (trigger_tx, trigger_rx) = mpsc::channel(4);
    let listener =
        BroadcastListener::new(controller.clone(), store.clone(), clock.clone(), ADDRESS)
        .with_trigger(trigger_tx);
    Setup {
        listener,
        controller,
        trigger_rx,
        station,
        interlock,
        store,
        clock,
    }
}

fn input(level: u8) -> BroadcastEvent {
    BroadcastEvent {
        input: Some(level),
        ..BroadcastEvent::default()
    }
}

async fn stored_strategy(s: &Setup) -> ChargingStrategy {
    s.controller
        .lock()
        .await
        .load_settings()
        .unwrap()
        .active_strategy
}

#[tokio::test]
async fn rising_edge_activates_override_and_triggers_evaluation() {
    let mut s = setup(ChargingStrategy::SurplusBatteryPrio);

    s.listener.handle_event(&input(1)).await;

    assert_eq!(stored_strategy(&s).await, ChargingStrategy::MaxWithoutBattery);
    assert_eq!(s.interlock.actions(), vec![InterlockAction::LockDischarge]);
    assert!(s.trigger_rx.try_recv().is_ok());

    // Same level again is not an edge
    s.listener.handle_event(&input(1)).await;
    assert_eq!(s.interlock.actions().len(), 1);
    assert!(s.trigger_rx.try_recv().is_err());
}

#[tokio::test]
async fn falling_edge_stops_and_turns_off() {
    let s = setup(ChargingStrategy::SurplusBatteryPrio);
    s.listener.handle_event(&input(1)).await;
    {
        let mut controller = s.controller.lock().await;
        controller
            .process_strategy(sample(&s.clock, 0.0, 300.0, 0.0, 0.0), ADDRESS)
            .await
            .unwrap();
        assert!(controller.context().is_active);
    }

    s.listener.handle_event(&input(0)).await;

    assert_eq!(stored_strategy(&s).await, ChargingStrategy::Off);
    assert!(!s.controller.lock().await.context().is_active);
    assert_eq!(s.station.count("ena 0"), 1);
    assert_eq!(
        s.interlock.actions(),
        vec![InterlockAction::LockDischarge, InterlockAction::UnlockDischarge]
    );
}

#[tokio::test]
async fn intent_is_committed_when_override_fails() {
    let s = setup(ChargingStrategy::SurplusVehiclePrio);
    s.interlock.set_failing(true);

    s.listener.handle_event(&input(1)).await;

    assert_eq!(stored_strategy(&s).await, ChargingStrategy::MaxWithoutBattery);
    assert_eq!(
        s.controller.lock().await.context().strategy,
        ChargingStrategy::MaxWithoutBattery
    );
    assert_eq!(
        s.store.get_context().unwrap().strategy,
        ChargingStrategy::MaxWithoutBattery
    );
    let logs = s.store.recent_logs(20).unwrap();
    assert!(logs.iter().any(|e| e.message.contains("incomplete")));
}

#[tokio::test]
async fn plug_and_state_changes_are_audited_once() {
    let s = setup(ChargingStrategy::Off);
    let event = BroadcastEvent {
        plug: Some(7),
        state: Some(2),
        ..BroadcastEvent::default()
    };

    let before = s.store.recent_logs(50).unwrap().len();
    s.listener.handle_event(&event).await;
    let control = s.store.get_control_state().unwrap();
    assert_eq!(control.last_plug, Some(7));
    assert_eq!(control.last_state, Some(2));
    assert!(control.plug_changed_at.is_some());
    let logged = s.store.recent_logs(50).unwrap().len();
    assert_eq!(logged, before + 2);

    s.listener.handle_event(&event).await;
    assert_eq!(s.store.recent_logs(50).unwrap().len(), logged);
    assert!(s.station.sent().is_empty());
    assert!(s.interlock.actions().is_empty());
}

#[tokio::test]
async fn run_consumes_transport_broadcasts() {
    let Setup {
        listener,
        controller,
        mut trigger_rx,
        ..
    } = setup(ChargingStrategy::SurplusBatteryPrio);
    let (tx, rx) = broadcast::channel(8);
    let task = tokio::spawn(listener.run(rx));

    tx.send(decode(br#"{"ID": "3", "P": 0}"#)).unwrap();
    tx.send(decode(br#"{"Input": 1}"#)).unwrap();
    tokio::time::timeout(Duration::from_secs(2), trigger_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        controller.lock().await.context().strategy,
        ChargingStrategy::MaxWithoutBattery
    );

    drop(tx);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}

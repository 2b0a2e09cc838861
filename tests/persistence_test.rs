use chrono::Utc;
use helios::context::{ChargingContext, Phases};
use helios::interlock::InterlockAction;
use helios::persistence::{
    ControlState, FileStateStore, InterlockRecord, LogEntry, LogSeverity, StateStore,
};
use helios::strategy::{ChargingStrategy, ChargingStrategyConfig};
use serde_json::json;

#[test]
fn fresh_store_has_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStateStore::open(dir.path().join("state.json"), 10).unwrap();

    assert!(store.get_settings().unwrap().is_none());
    assert_eq!(store.get_context().unwrap(), ChargingContext::default());
    assert_eq!(store.get_control_state().unwrap(), ControlState::default());
    assert!(store.recent_logs(5).unwrap().is_empty());
    assert!(!store.path().exists());
}

#[test]
fn sections_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    let now = Utc::now();

    {
        let store = FileStateStore::open(&path, 10).unwrap();
        let settings = ChargingStrategyConfig {
            active_strategy: ChargingStrategy::SurplusBatteryPrio,
            ..ChargingStrategyConfig::default()
        };
        store
            .save_settings(&serde_json::to_value(&settings).unwrap())
            .unwrap();

        let mut ctx = ChargingContext {
            strategy: ChargingStrategy::SurplusBatteryPrio,
            current_phases: Phases::Single,
            ..ChargingContext::default()
        };
        ctx.mark_started(8, now);
        store.save_context(&ctx).unwrap();

        store
            .update_control_state(&mut |control| {
                control.battery_discharge_since = Some(now);
                control.last_interlock = Some(InterlockRecord {
                    action: InterlockAction::UnlockDischarge,
                    at: now,
                    succeeded: true,
                });
            })
            .unwrap();
        store
            .append_log(LogEntry::new(now, LogSeverity::Info, "controller", "Charging started at 8A"))
            .unwrap();
    }

    let store = FileStateStore::open(&path, 10).unwrap();
    let settings =
        ChargingStrategyConfig::from_stored(&store.get_settings().unwrap().unwrap()).unwrap();
    assert_eq!(settings.active_strategy, ChargingStrategy::SurplusBatteryPrio);

    let ctx = store.get_context().unwrap();
    assert!(ctx.is_active);
    assert_eq!(ctx.current_ampere, 8);
    assert_eq!(ctx.current_phases, Phases::Single);
    assert_eq!(ctx.last_adjustment, Some(now));

    let control = store.get_control_state().unwrap();
    assert_eq!(control.battery_discharge_since, Some(now));
    assert_eq!(
        control.last_interlock.map(|r| r.action),
        Some(InterlockAction::UnlockDischarge)
    );

    let logs = store.recent_logs(10).unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].component, "controller");
}

#[test]
fn context_patch_is_partial_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let store = FileStateStore::open(&path, 10).unwrap();

    store
        .update_context(&json!({"strategy": "max_with_battery", "adjustment_count": 4}))
        .unwrap();
    let ctx = store
        .update_context(&json!({"calculated_surplus": 1234.5}))
        .unwrap();
    assert_eq!(ctx.strategy, ChargingStrategy::MaxWithBattery);
    assert_eq!(ctx.adjustment_count, 4);
    assert_eq!(ctx.calculated_surplus, Some(1234.5));

    let reopened = FileStateStore::open(&path, 10).unwrap();
    assert_eq!(reopened.get_context().unwrap(), ctx);
}

#[test]
fn log_capacity_applies_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let now = Utc::now();

    let store = FileStateStore::open(&path, 3).unwrap();
    for i in 0..3 {
        store
            .append_log(LogEntry::new(now, LogSeverity::Warn, "test", format!("a{}", i)))
            .unwrap();
    }
    drop(store);

    let store = FileStateStore::open(&path, 3).unwrap();
    store
        .append_log(LogEntry::new(now, LogSeverity::Error, "test", "b"))
        .unwrap();
    let messages: Vec<String> = store
        .recent_logs(10)
        .unwrap()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, vec!["a1", "a2", "b"]);
}

#[test]
fn corrupt_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{not json").unwrap();
    assert!(FileStateStore::open(&path, 10).is_err());
}

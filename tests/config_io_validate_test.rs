use helios::config::Config;
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.device.host = "10.0.0.5".to_string();
    cfg.battery.lock_discharge_command = "battery-ctl lock".to_string();
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert_eq!(loaded.device.host, "10.0.0.5");
    assert_eq!(loaded.device.address().as_deref(), Some("10.0.0.5:7090"));
    assert_eq!(loaded.battery.lock_discharge_command, "battery-ctl lock");
    assert_eq!(loaded.logging.file, cfg.logging.file);
}

#[test]
fn partial_yaml_keeps_defaults() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(
        tmp.path(),
        b"device:\n  host: wallbox.local\nbattery:\n  enabled: true\n",
    )
    .unwrap();
    let cfg = Config::from_file(tmp.path()).unwrap();
    assert_eq!(cfg.device.port, 7090);
    assert_eq!(cfg.charger.min_current_ampere, 6);
    assert!(cfg.battery.enabled);
    assert_eq!(cfg.battery.protection.duration_seconds, 120);
    assert_eq!(cfg.strategy.active_strategy, helios::strategy::ChargingStrategy::Off);
    assert!(cfg.validate().is_ok());
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    assert!(cfg.validate().is_ok());

    cfg.device.port = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.device.response_timeout_ms = 0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.charger.min_current_ampere = 20;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.battery.protection.threshold_watt = 100.0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.strategy.physical_phase_switch = 2;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.poll_interval_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    let err = Config::from_file(tmp.path()).unwrap_err();
    let msg = format!("{}", err);
    assert!(msg.contains("Serialization error"));
}

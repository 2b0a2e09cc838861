use super::*;

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 7090,
            bind_address: "0.0.0.0:7090".to_string(),
            response_timeout_ms: 3000,
            cooldown_ms: 250,
        }
    }
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            nominal_voltage: 230.0,
            min_current_ampere: 6,
            max_current_single_phase: 16,
            max_current_three_phase: 16,
            charging_power_floor_watt: 100.0,
            active_phase_current_ma: 1000,
        }
    }
}

impl Default for DischargeProtectionConfig {
    fn default() -> Self {
        Self {
            threshold_watt: -500.0,
            duration_seconds: 120,
            derate_ampere: 2,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lock_discharge_command: String::new(),
            unlock_discharge_command: String::new(),
            enable_grid_charge_command: String::new(),
            disable_grid_charge_command: String::new(),
            min_command_interval_seconds: 5,
            command_timeout_seconds: 30,
            protection: DischargeProtectionConfig::default(),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            live_data_file: "/run/helios/live_data.json".to_string(),
            url: String::new(),
            max_age_seconds: 60,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: "/data/helios_state.json".to_string(),
            log_capacity: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/helios.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            charger: ChargerConfig::default(),
            strategy: crate::strategy::ChargingStrategyConfig::default(),
            battery: BatteryConfig::default(),
            meter: MeterConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
            poll_interval_ms: 15_000,
        }
    }
}

//! Energy meter collaborator
//!
//! The controller never measures power itself. An external exporter keeps a
//! live-data document up to date; this module reads it and turns it into the
//! [`PowerSample`] a control cycle works on.

use crate::clock::Clock;
use crate::config::MeterConfig;
use crate::error::{HeliosError, Result};
use crate::logging::get_logger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Power-flow sample consumed by a control cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// PV production (W)
    pub pv_power: f64,
    /// Battery power (W), positive while charging, negative while discharging
    pub battery_power: f64,
    /// House consumption including the charger (W)
    pub house_power: f64,
    /// Grid power (W), positive while importing
    pub grid_power: f64,
    /// Battery state of charge (%)
    pub battery_soc: f64,
    /// Charger draw (W)
    pub wallbox_power: f64,
    /// When the meter took the sample
    pub timestamp: DateTime<Utc>,
}

impl PowerSample {
    /// Combine meter live data with the charger draw it was read for
    pub fn from_live(live: &LiveData, wallbox_power: f64) -> Self {
        Self {
            pv_power: live.pv_power,
            battery_power: live.battery_power,
            house_power: live.house_power,
            grid_power: live.grid_power,
            battery_soc: live.battery_soc,
            wallbox_power,
            timestamp: live.timestamp,
        }
    }
}

/// Live data as published by the meter exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    pub pv_power: f64,
    pub battery_power: f64,
    pub battery_soc: f64,
    pub house_power: f64,
    pub grid_power: f64,
    #[serde(default)]
    pub autarky: f64,
    #[serde(default)]
    pub self_consumption: f64,
    pub timestamp: DateTime<Utc>,
}

/// Source of live power-flow data
#[async_trait]
pub trait EnergyMeter: Send + Sync {
    /// Read the latest live data; `charger_power_w` is the charger's current
    /// draw as last measured by the controller.
    async fn read_live_data(&self, charger_power_w: f64) -> Result<LiveData>;
}

/// Normalize a freshly read document against the charger draw and clock.
///
/// The meter's house figure includes the charger; because both are measured
/// independently it can briefly read below the charger draw, which would make
/// the house-only consumption negative.
fn normalize(mut live: LiveData, charger_power_w: f64, now: DateTime<Utc>, max_age_s: u64) -> Result<LiveData> {
    let age = (now - live.timestamp).num_seconds();
    if max_age_s > 0 && age > max_age_s as i64 {
        return Err(HeliosError::meter(format!(
            "live data is {}s old (limit {}s)",
            age, max_age_s
        )));
    }
    for (name, value) in [
        ("pv_power", live.pv_power),
        ("battery_power", live.battery_power),
        ("house_power", live.house_power),
        ("grid_power", live.grid_power),
    ] {
        if !value.is_finite() {
            return Err(HeliosError::meter(format!("{} is not a finite number", name)));
        }
    }
    live.house_power = live.house_power.max(charger_power_w.max(0.0));
    live.pv_power = live.pv_power.max(0.0);
    Ok(live)
}

/// Reads the exporter's JSON document from disk
pub struct FileEnergyMeter {
    path: String,
    max_age_seconds: u64,
    clock: Arc<dyn Clock>,
    logger: crate::logging::StructuredLogger,
}

impl FileEnergyMeter {
    pub fn new(config: &MeterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: config.live_data_file.clone(),
            max_age_seconds: config.max_age_seconds,
            clock,
            logger: get_logger("meter"),
        }
    }
}

#[async_trait]
impl EnergyMeter for FileEnergyMeter {
    async fn read_live_data(&self, charger_power_w: f64) -> Result<LiveData> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| HeliosError::meter(format!("cannot read {}: {}", self.path, e)))?;
        let live: LiveData = serde_json::from_str(&contents)?;
        let live = normalize(live, charger_power_w, self.clock.now(), self.max_age_seconds)?;
        self.logger.trace(&format!(
            "Live data: pv={:.0}W house={:.0}W battery={:.0}W grid={:.0}W soc={:.0}%",
            live.pv_power, live.house_power, live.battery_power, live.grid_power, live.battery_soc
        ));
        Ok(live)
    }
}

/// Fetches the live-data document from an HTTP endpoint
#[cfg(feature = "meter-http")]
pub struct HttpEnergyMeter {
    client: reqwest::Client,
    url: String,
    max_age_seconds: u64,
    clock: Arc<dyn Clock>,
}

#[cfg(feature = "meter-http")]
impl HttpEnergyMeter {
    pub fn new(config: &MeterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(HeliosError::config("meter.url is required for the HTTP meter"));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            max_age_seconds: config.max_age_seconds,
            clock,
        })
    }
}

#[cfg(feature = "meter-http")]
#[async_trait]
impl EnergyMeter for HttpEnergyMeter {
    async fn read_live_data(&self, charger_power_w: f64) -> Result<LiveData> {
        let live: LiveData = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        normalize(live, charger_power_w, self.clock.now(), self.max_age_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Write;

    fn live_at(ts: DateTime<Utc>) -> LiveData {
        LiveData {
            pv_power: 4200.0,
            battery_power: -300.0,
            battery_soc: 64.0,
            house_power: 900.0,
            grid_power: 0.0,
            autarky: 100.0,
            self_consumption: 80.0,
            timestamp: ts,
        }
    }

    #[test]
    fn normalize_rejects_stale_data() {
        let now = Utc::now();
        let live = live_at(now - chrono::Duration::seconds(120));
        assert!(matches!(
            normalize(live, 0.0, now, 60),
            Err(HeliosError::Meter { .. })
        ));
    }

    #[test]
    fn normalize_lifts_house_to_charger_draw() {
        let now = Utc::now();
        let live = normalize(live_at(now), 4140.0, now, 60).unwrap();
        assert!((live.house_power - 4140.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn file_meter_reads_document() {
        let clock = Arc::new(ManualClock::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let doc = serde_json::to_string(&live_at(clock.now())).unwrap();
        file.write_all(doc.as_bytes()).unwrap();

        let config = MeterConfig {
            live_data_file: file.path().to_string_lossy().to_string(),
            ..MeterConfig::default()
        };
        let meter = FileEnergyMeter::new(&config, clock.clone());
        let live = meter.read_live_data(0.0).await.unwrap();
        assert!((live.pv_power - 4200.0).abs() < f64::EPSILON);

        let sample = PowerSample::from_live(&live, 1500.0);
        assert!((sample.wallbox_power - 1500.0).abs() < f64::EPSILON);
        assert_eq!(sample.timestamp, clock.now());
    }

    #[tokio::test]
    async fn file_meter_missing_file_is_meter_error() {
        let config = MeterConfig {
            live_data_file: "/definitely/missing/live.json".to_string(),
            ..MeterConfig::default()
        };
        let meter = FileEnergyMeter::new(&config, Arc::new(ManualClock::default()));
        assert!(matches!(
            meter.read_live_data(0.0).await,
            Err(HeliosError::Meter { .. })
        ));
    }
}

use anyhow::{Context, Result};
use helios::clock::{Clock, SystemClock};
use helios::config::Config;
use helios::controller::StrategyController;
use helios::interlock::CommandInterlock;
use helios::listener::BroadcastListener;
use helios::meter::{EnergyMeter, FileEnergyMeter};
use helios::persistence::{FileStateStore, StateStore};
use helios::runtime::Runtime;
use helios::transport::DeviceTransport;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(feature = "meter-http")]
fn http_meter(config: &Config, clock: Arc<dyn Clock>) -> Result<Option<Arc<dyn EnergyMeter>>> {
    if config.meter.url.trim().is_empty() {
        return Ok(None);
    }
    let meter = helios::meter::HttpEnergyMeter::new(&config.meter, clock)
        .context("Failed to create HTTP meter")?;
    Ok(Some(Arc::new(meter)))
}

#[cfg(not(feature = "meter-http"))]
fn http_meter(config: &Config, _clock: Arc<dyn Clock>) -> Result<Option<Arc<dyn EnergyMeter>>> {
    if !config.meter.url.trim().is_empty() {
        warn!("meter.url is set but the meter-http feature is disabled; reading the live-data file");
    }
    Ok(None)
}

fn build_meter(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn EnergyMeter>> {
    match http_meter(config, clock.clone())? {
        Some(meter) => Ok(meter),
        None => Ok(Arc::new(FileEnergyMeter::new(&config.meter, clock))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    helios::logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Helios {} starting up", env!("APP_VERSION"));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn StateStore> = Arc::new(
        FileStateStore::open(&config.persistence.state_file, config.persistence.log_capacity)
            .context("Failed to open state file")?,
    );
    let transport = Arc::new(
        DeviceTransport::bind(&config.device)
            .await
            .context("Failed to bind charging station socket")?,
    );
    let interlock = Arc::new(CommandInterlock::new(&config.battery));

    let mut controller = StrategyController::new(
        transport.clone(),
        interlock,
        store.clone(),
        clock.clone(),
        config.charger.clone(),
        config.battery.clone(),
    )
    .context("Failed to restore controller state")?;
    controller
        .seed_settings(&config.strategy)
        .context("Failed to seed strategy settings")?;
    let address = config.device.address().unwrap_or_default();
    if address.is_empty() {
        warn!("device.host is empty; cycles will fail until a charging station is configured");
    } else if let Err(e) = controller.identify_device(&address).await {
        warn!("Could not read charging station identity: {}", e);
    }
    let controller = Arc::new(Mutex::new(controller));

    let meter = build_meter(&config, clock.clone())?;
    let (mut runtime, handle) =
        Runtime::new(controller.clone(), meter, &address, config.poll_interval_ms);

    let listener = BroadcastListener::new(controller, store, clock, &address)
        .with_trigger(handle.trigger_sender());
    let listener_task = tokio::spawn(listener.run(transport.subscribe()));

    runtime.run().await;

    listener_task.abort();
    info!("Helios shutdown complete");
    Ok(())
}

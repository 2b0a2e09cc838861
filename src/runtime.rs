//! Evaluation scheduler
//!
//! Runs the controller every `poll_interval_ms`, and immediately when the
//! broadcast listener reports an input edge. A tick that finds the controller
//! still busy (a slow round trip, an override in progress) is skipped rather
//! than queued.

use crate::controller::{CycleOutcome, StrategyController};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::meter::{EnergyMeter, PowerSample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::time::{MissedTickBehavior, interval};

/// Pending triggers beyond this are redundant
const TRIGGER_DEPTH: usize = 4;

/// Handle for nudging or stopping a running [`Runtime`]
#[derive(Clone)]
pub struct RuntimeHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::UnboundedSender<()>,
}

impl RuntimeHandle {
    /// Sender the broadcast listener uses to request an evaluation
    pub fn trigger_sender(&self) -> mpsc::Sender<()> {
        self.trigger_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Counters kept by the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub overruns: u64,
}

pub struct Runtime {
    controller: Arc<Mutex<StrategyController>>,
    meter: Arc<dyn EnergyMeter>,
    address: String,
    poll_interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::UnboundedReceiver<()>,
    stats: RuntimeStats,
    logger: StructuredLogger,
}

impl Runtime {
    pub fn new(
        controller: Arc<Mutex<StrategyController>>,
        meter: Arc<dyn EnergyMeter>,
        address: &str,
        poll_interval_ms: u64,
    ) -> (Self, RuntimeHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_DEPTH);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let logger = get_logger_with_context(LogContext::new("runtime").with_device(address));
        let runtime = Self {
            controller,
            meter,
            address: address.to_string(),
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            trigger_rx,
            shutdown_rx,
            stats: RuntimeStats::default(),
            logger,
        };
        (
            runtime,
            RuntimeHandle {
                trigger_tx,
                shutdown_tx,
            },
        )
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    /// Run until shutdown is requested or Ctrl-C arrives
    pub async fn run(&mut self) {
        self.logger.info(&format!(
            "Starting evaluation loop every {}ms",
            self.poll_interval.as_millis()
        ));
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let controller = self.controller.clone();
                    match controller.try_lock() {
                        Ok(guard) => {
                            self.evaluate(guard).await;
                        }
                        Err(_) => {
                            self.stats.skipped_ticks += 1;
                            self.logger.warn("Previous evaluation still running, skipping tick");
                        }
                    }
                }
                Some(()) = self.trigger_rx.recv() => {
                    self.logger.debug("Evaluation triggered by input edge");
                    let controller = self.controller.clone();
                    let guard = controller.lock().await;
                    self.evaluate(guard).await;
                }
                _ = self.shutdown_rx.recv() => {
                    self.logger.info("Shutdown requested");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    self.logger.info("Ctrl-C received, shutting down");
                    break;
                }
            }
        }

        let status = self.controller.lock().await.get_status();
        match serde_json::to_string(&status) {
            Ok(json) => self.logger.info(&format!("Final status: {}", json)),
            Err(e) => self.logger.warn(&format!("Cannot serialize final status: {}", e)),
        }
    }

    /// Read the meter and run one cycle, waiting for the controller if busy
    pub async fn evaluate_now(&mut self) -> Option<CycleOutcome> {
        let controller = self.controller.clone();
        let guard = controller.lock().await;
        self.evaluate(guard).await
    }

    async fn evaluate(
        &mut self,
        mut controller: MutexGuard<'_, StrategyController>,
    ) -> Option<CycleOutcome> {
        let started = std::time::Instant::now();
        let charger_power = controller
            .last_observation()
            .map(|o| o.power_watt)
            .unwrap_or(0.0);

        let live = match self.meter.read_live_data(charger_power).await {
            Ok(live) => live,
            Err(e) => {
                self.logger
                    .warn(&format!("No live data, skipping evaluation: {}", e));
                return None;
            }
        };
        let sample = PowerSample::from_live(&live, charger_power);

        let outcome = match controller.process_strategy(sample, &self.address).await {
            Ok(outcome) => {
                self.logger.debug(&format!("Cycle outcome: {:?}", outcome));
                Some(outcome)
            }
            Err(e) => {
                self.logger.error(&format!("Evaluation failed: {}", e));
                None
            }
        };
        drop(controller);

        self.stats.cycles += 1;
        if started.elapsed() > self.poll_interval {
            self.stats.overruns += 1;
            self.logger.warn(&format!(
                "Evaluation took {}ms, longer than the poll interval",
                started.elapsed().as_millis()
            ));
        }
        outcome
    }
}

//! Broadcast listener
//!
//! Consumes the datagrams the transport could not match to a request. A
//! rising edge on the station's digital input switches to the configured
//! override strategy, a falling edge stops charging and switches to off. Plug
//! and state changes are only recorded.

use crate::clock::Clock;
use crate::controller::StrategyController;
use crate::logging::{StructuredLogger, get_logger};
use crate::persistence::{LogEntry, LogSeverity, StateStore};
use crate::protocol::{BroadcastEvent, Response};
use crate::strategy::ChargingStrategy;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Edge on the digital input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEdge {
    Rising,
    Falling,
}

pub struct BroadcastListener {
    controller: Arc<Mutex<StrategyController>>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    address: String,
    trigger: Option<mpsc::Sender<()>>,
    logger: StructuredLogger,
}

impl BroadcastListener {
    pub fn new(
        controller: Arc<Mutex<StrategyController>>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        address: &str,
    ) -> Self {
        Self {
            controller,
            store,
            clock,
            address: address.to_string(),
            trigger: None,
            logger: get_logger("listener"),
        }
    }

    /// Request an immediate evaluation through `trigger` after an input edge
    pub fn with_trigger(mut self, trigger: mpsc::Sender<()>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Handle datagrams until the transport goes away
    pub async fn run(self, receiver: broadcast::Receiver<Response>) {
        let mut stream = BroadcastStream::new(receiver);
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => {
                    if let Some(event) = BroadcastEvent::from_response(&response) {
                        self.handle_event(&event).await;
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    self.logger
                        .warn(&format!("Missed {} broadcasts, listener lagging", skipped));
                }
            }
        }
        self.logger.debug("Broadcast stream closed");
    }

    pub async fn handle_event(&self, event: &BroadcastEvent) {
        let now = self.clock.now();
        let mut edge = None;
        let mut changes = Vec::new();

        let result = self.store.update_control_state(&mut |control| {
            edge = None;
            changes.clear();
            if let Some(input) = event.input {
                edge = match (control.last_input, input) {
                    (Some(0) | None, 1) => Some(InputEdge::Rising),
                    (Some(1), 0) => Some(InputEdge::Falling),
                    _ => None,
                };
                control.last_input = Some(input);
            }
            if let Some(plug) = event.plug
                && control.last_plug != Some(plug)
            {
                changes.push(format!("plug {:?} -> {}", control.last_plug, plug));
                control.last_plug = Some(plug);
                control.plug_changed_at = Some(now);
            }
            if let Some(state) = event.state
                && control.last_state != Some(state)
            {
                changes.push(format!("state {:?} -> {}", control.last_state, state));
                control.last_state = Some(state);
                control.state_changed_at = Some(now);
            }
        });
        if let Err(e) = result {
            self.logger
                .error(&format!("Cannot track broadcast {:?}: {}", event, e));
            return;
        }

        for change in changes {
            self.logger.info(&format!("Station {}", change));
            self.record(LogSeverity::Info, format!("Station {}", change));
        }

        if let Some(edge) = edge {
            self.handle_input_edge(edge).await;
        }
    }

    /// Apply an input override: attempt the side effects, then always commit
    /// the strategy that matches the physical input.
    pub async fn handle_input_edge(&self, edge: InputEdge) {
        let mut controller = self.controller.lock().await;

        let target = match edge {
            InputEdge::Rising => match controller.load_settings() {
                Ok(settings) => settings.input_x1_strategy,
                Err(e) => {
                    self.logger.warn(&format!(
                        "Settings unavailable ({}), using default input strategy",
                        e
                    ));
                    ChargingStrategy::MaxWithoutBattery
                }
            },
            InputEdge::Falling => ChargingStrategy::Off,
        };
        self.logger
            .info(&format!("Digital input {:?}: switching to {}", edge, target));

        if edge == InputEdge::Falling
            && let Err(e) = controller.force_stop(&self.address).await
        {
            self.logger
                .warn(&format!("Stop on input release failed: {}", e));
        }
        if let Err(e) = controller.switch_strategy(target, &self.address).await {
            self.logger
                .warn(&format!("Override to {} incomplete: {}", target, e));
            self.record(
                LogSeverity::Warn,
                format!("Input override to {} incomplete: {}", target, e),
            );
        }

        controller.commit_strategy_intent(target);
        drop(controller);
        self.record(
            LogSeverity::Info,
            format!("Input override committed: {}", target),
        );

        if let Some(trigger) = &self.trigger {
            // A full channel already holds a pending evaluation
            let _ = trigger.try_send(());
        }
    }

    fn record(&self, severity: LogSeverity, message: String) {
        let entry = LogEntry::new(self.clock.now(), severity, self.logger.component(), message);
        if let Err(e) = self.store.append_log(entry) {
            self.logger.warn(&format!("Failed to append event log: {}", e));
        }
    }
}

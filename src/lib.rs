//! # Helios - PV surplus charging controller
//!
//! Decides every few seconds whether, and how hard, an EV charging station
//! should draw power, based on live solar, house and battery telemetry, and
//! issues those decisions to the station over its UDP text/JSON protocol.
//!
//! ## Features
//!
//! - **Surplus strategies**: battery or vehicle priority, with start/stop
//!   hysteresis and current-change suppression
//! - **Max-power strategies**: immediate charging at the rated maximum, with
//!   an optional home-battery discharge lock
//! - **Reconciliation**: stored state is corrected against the station's
//!   reports after restarts or external interference
//! - **Digital input override**: a broadcast input edge switches strategy
//! - **Persistence**: context, hysteresis timers and an event log survive
//!   restarts
//!
//! ## Architecture
//!
//! - `config`: YAML configuration and validation
//! - `logging`: Structured logging and tracing
//! - `protocol`: Wire codec for commands, reports and broadcasts
//! - `transport`: Single-in-flight UDP command queue
//! - `strategy`: Strategy settings and surplus/current arithmetic
//! - `context`: Live charging context
//! - `controller`: Evaluation cycle, strategy switches, interlock coordination
//! - `listener`: Broadcast-driven overrides and plug/state audit
//! - `interlock`: Home battery command execution
//! - `meter`: Energy meter live data
//! - `persistence`: State store
//! - `runtime`: Evaluation scheduler

pub mod clock;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod interlock;
pub mod listener;
pub mod logging;
pub mod meter;
pub mod persistence;
pub mod protocol;
pub mod runtime;
pub mod strategy;
pub mod transport;


pub use error::{HeliosError, Result};

/// Application version including the git revision when built from a checkout
pub const VERSION: &str = env!("APP_VERSION");

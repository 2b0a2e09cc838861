//! Live control state of the charging loop
//!
//! There is exactly one [`ChargingContext`]. The controller owns it, mutates it
//! through the transitions below and writes it back to the state store after
//! every change.

use crate::strategy::ChargingStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase layout the charger is drawing on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phases {
    Single,
    #[default]
    Three,
}

impl Phases {
    pub fn count(self) -> u32 {
        match self {
            Phases::Single => 1,
            Phases::Three => 3,
        }
    }

    /// Anything other than exactly one active phase is treated as three-phase
    pub fn from_active_count(active: usize) -> Self {
        if active == 1 { Phases::Single } else { Phases::Three }
    }
}

impl TryFrom<u8> for Phases {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Phases::Single),
            3 => Ok(Phases::Three),
            other => Err(format!("phase count must be 1 or 3, got {}", other)),
        }
    }
}

impl From<Phases> for u8 {
    fn from(phases: Phases) -> u8 {
        phases.count() as u8
    }
}

/// Controller state shared across cycles and restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargingContext {
    pub strategy: ChargingStrategy,
    pub is_active: bool,
    pub current_ampere: u32,
    pub target_ampere: u32,
    pub current_phases: Phases,
    pub last_adjustment: Option<DateTime<Utc>>,
    pub start_delay_tracker_since: Option<DateTime<Utc>>,
    pub below_threshold_since: Option<DateTime<Utc>>,
    pub adjustment_count: u64,
    pub calculated_surplus: Option<f64>,
}

impl Default for ChargingContext {
    fn default() -> Self {
        Self {
            strategy: ChargingStrategy::Off,
            is_active: false,
            current_ampere: 0,
            target_ampere: 0,
            current_phases: Phases::Three,
            last_adjustment: None,
            start_delay_tracker_since: None,
            below_threshold_since: None,
            adjustment_count: 0,
            calculated_surplus: None,
        }
    }
}

impl ChargingContext {
    /// Charging confirmed at `ampere`
    pub fn mark_started(&mut self, ampere: u32, now: DateTime<Utc>) {
        self.is_active = true;
        self.current_ampere = ampere;
        self.target_ampere = ampere;
        self.last_adjustment = Some(now);
        self.start_delay_tracker_since = None;
        self.below_threshold_since = None;
    }

    /// Charging confirmed stopped
    pub fn mark_stopped(&mut self) {
        self.is_active = false;
        self.current_ampere = 0;
        self.target_ampere = 0;
        self.below_threshold_since = None;
    }

    /// Current change confirmed
    pub fn mark_adjusted(&mut self, ampere: u32, now: DateTime<Utc>) {
        self.current_ampere = ampere;
        self.target_ampere = ampere;
        self.last_adjustment = Some(now);
        self.adjustment_count += 1;
    }

    /// Forget pending start/stop intent
    pub fn clear_hysteresis(&mut self) {
        self.start_delay_tracker_since = None;
        self.below_threshold_since = None;
    }

    /// Check the invariants a stored context must satisfy
    pub fn is_consistent(&self) -> bool {
        let idle_zeroed = self.is_active || (self.current_ampere == 0 && self.target_ampere == 0);
        let timers = !(self.is_active && self.start_delay_tracker_since.is_some())
            && !(!self.is_active && self.below_threshold_since.is_some());
        idle_zeroed && timers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle_and_consistent() {
        let ctx = ChargingContext::default();
        assert!(!ctx.is_active);
        assert_eq!(ctx.current_phases.count(), 3);
        assert!(ctx.is_consistent());
    }

    #[test]
    fn transitions_keep_invariants() {
        let now = Utc::now();
        let mut ctx = ChargingContext {
            start_delay_tracker_since: Some(now),
            ..ChargingContext::default()
        };
        ctx.mark_started(10, now);
        assert!(ctx.is_consistent());
        ctx.below_threshold_since = Some(now);
        ctx.mark_adjusted(12, now);
        assert_eq!(ctx.adjustment_count, 1);
        ctx.mark_stopped();
        assert!(ctx.is_consistent());
        assert_eq!(ctx.current_ampere, 0);
        assert_eq!(ctx.target_ampere, 0);
    }

    #[test]
    fn phases_serialize_as_numbers() {
        let ctx = ChargingContext {
            current_phases: Phases::Single,
            ..ChargingContext::default()
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["current_phases"], 1);
        assert!(serde_json::from_value::<Phases>(serde_json::json!(2)).is_err());
    }
}

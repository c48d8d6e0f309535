use serde::{Deserialize, Serialize};

use crate::meter::MeterReading;

/// Actuator position and the reading at which it must close on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub actuator_open: bool,
    pub close_at_threshold: u32,
}

impl SafetyState {
    pub fn status_text(&self) -> &'static str {
        if self.actuator_open {
            "open"
        } else {
            "close"
        }
    }
}

/// Cumulative quantity compared against the close-at threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredQuantity {
    /// Whole kWh.
    #[default]
    Energy,
    /// Whole m³.
    Volume,
}

impl MonitoredQuantity {
    /// `None` when the reading does not carry this quantity.
    pub fn whole_units(self, reading: &MeterReading) -> Option<u64> {
        match self {
            Self::Energy => Some(reading.energy_wh / 1000),
            Self::Volume => reading.volume_l.map(|litres| litres / 1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoCloseGuard {
    pub enabled: bool,
    pub quantity: MonitoredQuantity,
}

impl Default for AutoCloseGuard {
    fn default() -> Self {
        Self {
            enabled: true,
            quantity: MonitoredQuantity::Energy,
        }
    }
}

impl AutoCloseGuard {
    pub fn new(enabled: bool, quantity: MonitoredQuantity) -> Self {
        Self { enabled, quantity }
    }

    /// True when the actuator is open and the reading has reached the threshold.
    pub fn should_close(&self, state: &SafetyState, reading: &MeterReading) -> bool {
        if !self.enabled || !state.actuator_open {
            return false;
        }
        self.quantity
            .whole_units(reading)
            .is_some_and(|value| value >= u64::from(state.close_at_threshold))
    }
}

//! Automatic pump control with a hysteresis band, and manual override.
//!
//! ```text
//!            moisture < low
//!   OFF ───────────────────────▶ ON
//!    ▲                            │
//!    └────────────────────────────┘
//!            moisture > high
//! ```
//!
//! Between `low` and `high` the pump keeps whatever state it was in.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reading::{PumpMode, PumpState};

/// Allowed ranges for operator-chosen thresholds.
pub const LOW_RANGE: (f64, f64) = (10.0, 50.0);
pub const HIGH_RANGE: (f64, f64) = (50.0, 90.0);

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 30.0,
            high: 70.0,
        }
    }
}

/// One broken rule in an operator's threshold pair.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ThresholdViolation {
    #[error("low threshold {0} out of range [{min}, {max}]", min = LOW_RANGE.0, max = LOW_RANGE.1)]
    LowOutOfRange(f64),

    #[error("high threshold {0} out of range [{min}, {max}]", min = HIGH_RANGE.0, max = HIGH_RANGE.1)]
    HighOutOfRange(f64),

    #[error("low threshold ({low}) must be below high threshold ({high})")]
    Unordered { low: f64, high: f64 },
}

/// Every violation found in a threshold pair, in check order (low range,
/// high range, ordering).  Never empty.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid thresholds: {}", join_violations(.violations))]
pub struct SettingsError {
    pub violations: Vec<ThresholdViolation>,
}

fn join_violations(violations: &[ThresholdViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Thresholds {
    pub fn is_ordered(&self) -> bool {
        self.low < self.high
    }

    /// Check the thresholds an operator may set.  The policy itself accepts
    /// any pair; this is for rejecting bad input at the edge.  All rules are
    /// checked, so one error reports everything wrong with the pair.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut violations = Vec::new();
        if !(LOW_RANGE.0..=LOW_RANGE.1).contains(&self.low) {
            violations.push(ThresholdViolation::LowOutOfRange(self.low));
        }
        if !(HIGH_RANGE.0..=HIGH_RANGE.1).contains(&self.high) {
            violations.push(ThresholdViolation::HighOutOfRange(self.high));
        }
        if !self.is_ordered() {
            violations.push(ThresholdViolation::Unordered {
                low: self.low,
                high: self.high,
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SettingsError { violations })
        }
    }
}

// ---------------------------------------------------------------------------
// Settings / pump control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_auto_mode")]
    pub auto_mode: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
}

fn default_auto_mode() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_mode: true,
            thresholds: Thresholds::default(),
        }
    }
}

/// The parts of device state a control decision touches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PumpControl {
    pub status: PumpState,
    pub mode: PumpMode,
    pub settings: Settings,
}

// ---------------------------------------------------------------------------
// Auto mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoModePolicy {
    pub thresholds: Thresholds,
}

impl AutoModePolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    /// Next pump state for a fresh moisture sample.  With inverted
    /// thresholds the low check wins; nothing panics.
    pub fn next_state(&self, current: PumpState, moisture: f64) -> PumpState {
        if moisture < self.thresholds.low {
            PumpState::On
        } else if moisture > self.thresholds.high {
            PumpState::Off
        } else {
            current
        }
    }
}

/// What the pump should be doing given the settings.  Outside auto mode only
/// a manual command changes the pump, so the current state is kept.
pub fn desired_pump_state(settings: &Settings, current: PumpState, moisture: f64) -> PumpState {
    if settings.auto_mode {
        AutoModePolicy::new(settings.thresholds).next_state(current, moisture)
    } else {
        current
    }
}

// ---------------------------------------------------------------------------
// Manual override
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualCommand {
    pub status: PumpState,
}

impl ManualCommand {
    pub fn new(status: PumpState) -> Self {
        Self { status }
    }

    /// Manual always wins: set the status and switch automation off.
    pub fn apply(&self, control: &mut PumpControl) {
        control.status = self.status;
        control.mode = PumpMode::Manual;
        control.settings.auto_mode = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

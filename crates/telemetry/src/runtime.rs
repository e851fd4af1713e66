//! Cumulative pump ON-time from an ordered ON/OFF event history.

use time::OffsetDateTime;

use crate::reading::{PumpState, Reading};

/// Single-pass accumulator over pump readings sorted ascending by time.
///
/// An `ON` opens an interval (a later `ON` restarts it rather than
/// stacking); an `OFF` closes it; an `OFF` with nothing open is ignored.
/// Intervals that come out negative (clock skew, out-of-order data) count as
/// zero.
#[derive(Debug, Clone, Default)]
pub struct RuntimeAccumulator {
    total_secs: f64,
    open_since: Option<OffsetDateTime>,
}

impl RuntimeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, reading: &Reading) {
        match reading.pump_state() {
            PumpState::On => {
                self.open_since = Some(reading.timestamp);
            }
            PumpState::Off => {
                if let Some(start) = self.open_since.take() {
                    self.add_interval(start, reading.timestamp);
                }
            }
        }
    }

    /// Whether an `ON` is still waiting for its `OFF`.
    pub fn open_since(&self) -> Option<OffsetDateTime> {
        self.open_since
    }

    /// Close any open interval at `now` and return the total in seconds.
    pub fn finish(mut self, now: OffsetDateTime) -> f64 {
        if let Some(start) = self.open_since.take() {
            self.add_interval(start, now);
        }
        self.total_secs
    }

    fn add_interval(&mut self, start: OffsetDateTime, end: OffsetDateTime) {
        let secs = (end - start).as_seconds_f64();
        if secs < 0.0 {
            tracing::warn!(
                start = %start,
                end = %end,
                secs,
                "negative pump interval, counting as zero"
            );
            return;
        }
        self.total_secs += secs;
    }
}

/// Total seconds the pump was on across `readings`, treating a trailing
/// unmatched `ON` as still running at `now`.
pub fn total_runtime(readings: &[Reading], now: OffsetDateTime) -> f64 {
    let mut acc = RuntimeAccumulator::new();
    for r in readings {
        acc.observe(r);
    }
    acc.finish(now)
}

/// Human-readable duration: `45s`, `12m 5s`, `3h 20m`.  Fractions are
/// truncated.
pub fn format_runtime(seconds: f64) -> String {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

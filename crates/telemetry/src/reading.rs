//! History record envelope and timestamp handling.
//!
//! Records arrive from the store as loosely-shaped JSON objects.  A
//! [`Reading`] pins down the two fields everything depends on (`timestamp`,
//! `value`) and carries every other field through untouched in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

// ---------------------------------------------------------------------------
// Pump vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpState {
    On,
    #[default]
    Off,
}

impl PumpState {
    /// Interpret a stored history value.  Only the exact string `"ON"` means
    /// on; anything else (including `"on"`, numbers, null) counts as off.
    pub fn from_history_value(value: &Value) -> Self {
        match value.as_str() {
            Some("ON") => PumpState::On,
            _ => PumpState::Off,
        }
    }

    /// Parse an operator command, case-insensitive, whitespace trimmed.
    pub fn parse_command(s: &str) -> Result<Self, String> {
        match s.trim().to_uppercase().as_str() {
            "ON" => Ok(PumpState::On),
            "OFF" => Ok(PumpState::Off),
            other => Err(format!("unknown pump command '{other}'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PumpState::On => "ON",
            PumpState::Off => "OFF",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, PumpState::On)
    }
}

impl std::fmt::Display for PumpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a pump transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Trigger {
    Auto,
    Manual,
}

/// Control regime recorded on the pump actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpMode {
    #[default]
    Auto,
    Manual,
}

impl PumpMode {
    pub fn from_auto_mode(auto_mode: bool) -> Self {
        if auto_mode {
            PumpMode::Auto
        } else {
            PumpMode::Manual
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reading {
    pub fn new(timestamp: OffsetDateTime, value: Value) -> Self {
        Self {
            timestamp,
            value,
            extra: Map::new(),
        }
    }

    /// Build a reading from a raw store entry.  Returns `None` when the entry
    /// is not an object, has no string `timestamp`, or the timestamp cannot
    /// be parsed.
    pub fn from_entry(entry: &Value) -> Option<Self> {
        let obj = entry.as_object()?;
        let ts = obj.get("timestamp")?.as_str()?;
        if ts.is_empty() {
            return None;
        }
        let timestamp = parse_timestamp(ts)?;

        let extra = obj
            .iter()
            .filter(|(k, _)| k.as_str() != "timestamp" && k.as_str() != "value")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            timestamp,
            value: obj.get("value").cloned().unwrap_or(Value::Null),
            extra,
        })
    }

    /// Numeric moisture value.  Accepts JSON numbers and numeric strings.
    pub fn moisture(&self) -> Option<f64> {
        match &self.value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn pump_state(&self) -> PumpState {
        PumpState::from_history_value(&self.value)
    }

    pub fn trigger(&self) -> Option<Trigger> {
        match self.extra.get("trigger")?.as_str()? {
            "AUTO" => Some(Trigger::Auto),
            "MANUAL" => Some(Trigger::Manual),
            _ => None,
        }
    }

    /// Same reading with its timestamp expressed in `offset`.
    pub fn in_offset(&self, offset: UtcOffset) -> Self {
        Self {
            timestamp: self.timestamp.to_offset(offset),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse an absolute timestamp.  Strategies, first success wins:
///
/// 1. RFC 3339 (`+05:30` or trailing `Z`)
/// 2. general ISO 8601 with offset
/// 3. `YYYY-MM-DDTHH:MM:SS.ffffff+HHMM` (offset without colon)
///
/// A single space between date and time is treated as `T`.  Timestamps
/// without offset information are rejected.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    let normalized: String = if s.len() > 10 && s.as_bytes()[10] == b' ' {
        format!("{}T{}", &s[..10], &s[11..])
    } else {
        s.to_string()
    };

    if let Ok(ts) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(ts);
    }
    if let Ok(ts) = OffsetDateTime::parse(&normalized, &Iso8601::DEFAULT) {
        return Some(ts);
    }
    let compact_offset = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond][offset_hour sign:mandatory][offset_minute]"
    );
    OffsetDateTime::parse(&normalized, &compact_offset).ok()
}

/// Render an instant the way the store expects it: RFC 3339 in UTC with a
/// trailing `Z`.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    let utc = ts.to_offset(UtcOffset::UTC);
    utc.format(&Rfc3339).unwrap_or_else(|_| utc.to_string())
}

/// Parse a `±HH:MM` display offset such as `+05:30`.
pub fn parse_utc_offset(s: &str) -> Option<UtcOffset> {
    let fmt = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(s.trim(), &fmt).ok()
}

// ===========================================================================
// Tests
// ===========================================================================

//! Live device snapshot as stored under `devices/{id}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::policy::{PumpControl, Settings};
use crate::reading::{parse_timestamp, PumpMode, PumpState};

/// Seen within this many seconds: online.
const ONLINE_SECS: i64 = 60;
/// Seen within this many seconds: recently seen.
const RECENT_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Snapshot model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub sensors: Sensors,
    #[serde(default)]
    pub actuators: Actuators,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub info: DeviceInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sensors {
    #[serde(default)]
    pub moisture: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actuators {
    #[serde(default)]
    pub pump: Pump,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pump {
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: PumpState,
    #[serde(default, deserialize_with = "lenient_mode")]
    pub mode: PumpMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub last_seen: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            location: default_location(),
            name: default_name(),
            last_seen: String::new(),
        }
    }
}

fn default_location() -> String {
    "Field A".to_string()
}

fn default_name() -> String {
    "Main Field Sensor".to_string()
}

fn lenient_status<'de, D>(deserializer: D) -> Result<PumpState, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(PumpState::from_history_value(&v))
}

fn lenient_mode<'de, D>(deserializer: D) -> Result<PumpMode, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(match v.as_str() {
        Some("MANUAL") => PumpMode::Manual,
        _ => PumpMode::Auto,
    })
}

impl DeviceState {
    /// Decode a store subtree.  An absent device reads as all defaults.
    pub fn from_snapshot(value: Option<Value>) -> Result<Self, serde_json::Error> {
        match value {
            Some(v) => serde_json::from_value(v),
            None => Ok(Self::default()),
        }
    }

    pub fn moisture(&self) -> f64 {
        self.sensors.moisture
    }

    pub fn control(&self) -> PumpControl {
        PumpControl {
            status: self.actuators.pump.status,
            mode: self.actuators.pump.mode,
            settings: self.settings,
        }
    }

    pub fn connectivity(&self, now: OffsetDateTime) -> Connectivity {
        Connectivity::from_last_seen(&self.info.last_seen, now)
    }
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Recent { secs: i64 },
    Offline,
    Unknown,
}

impl Connectivity {
    pub fn from_last_seen(last_seen: &str, now: OffsetDateTime) -> Self {
        let Some(seen) = parse_timestamp(last_seen) else {
            return Connectivity::Unknown;
        };
        let age = (now - seen).whole_seconds();
        if age < ONLINE_SECS {
            Connectivity::Online
        } else if age < RECENT_SECS {
            Connectivity::Recent { secs: age }
        } else {
            Connectivity::Offline
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

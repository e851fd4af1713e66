//! TOML config file loading, validation, and seeding of the monitored
//! device document.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use time::{Duration, UtcOffset};

use soil_telemetry::policy::{HIGH_RANGE, LOW_RANGE};
use soil_telemetry::reading::parse_utc_offset;
use soil_telemetry::{DeviceState, PumpMode, Settings, Thresholds};

use crate::auth::DEFAULT_SESSION_TTL;
use crate::devices::{check_device_id, Devices};

/// Poll cadence bounds, in seconds.
const POLL_INTERVAL_RANGE: (u64, u64) = (1, 3600);

/// Session lifetime bounds, in hours.
const SESSION_TTL_RANGE: (u64, u64) = (1, 24 * 365);

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dashboard: DashboardSection,
    #[serde(default)]
    pub device: Option<DeviceSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardSection {
    pub device_id: String,
    pub poll_interval_sec: u64,
    pub default_history_hours: f64,
    pub display_utc_offset: String,
    pub session_ttl_hours: u64,
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            device_id: "device_001".to_string(),
            poll_interval_sec: 5,
            default_history_hours: 24.0,
            display_utc_offset: "+00:00".to_string(),
            session_ttl_hours: DEFAULT_SESSION_TTL.whole_hours() as u64,
        }
    }
}

/// Initial device document, written only if the store has none.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    #[serde(default = "default_seed_name")]
    pub name: String,
    #[serde(default = "default_seed_location")]
    pub location: String,
    #[serde(default = "default_true")]
    pub auto_mode: bool,
    #[serde(default = "default_low")]
    pub threshold_low: f64,
    #[serde(default = "default_high")]
    pub threshold_high: f64,
}

fn default_seed_name() -> String {
    DeviceState::default().info.name
}

fn default_seed_location() -> String {
    DeviceState::default().info.location
}

fn default_true() -> bool {
    true
}

fn default_low() -> f64 {
    Thresholds::default().low
}

fn default_high() -> f64 {
    Thresholds::default().high
}

impl DeviceSeed {
    pub fn to_device_state(&self) -> DeviceState {
        let mut d = DeviceState::default();
        d.info.name = self.name.clone();
        d.info.location = self.location.clone();
        d.settings = Settings {
            auto_mode: self.auto_mode,
            thresholds: Thresholds {
                low: self.threshold_low,
                high: self.threshold_high,
            },
        };
        d.actuators.pump.mode = PumpMode::from_auto_mode(self.auto_mode);
        d
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_dashboard(&mut errors);
        self.validate_device(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_dashboard(&self, errors: &mut Vec<String>) {
        let d = &self.dashboard;

        if let Err(msg) = check_device_id(d.device_id.trim()) {
            errors.push(format!("dashboard: {msg}"));
        }

        let (min, max) = POLL_INTERVAL_RANGE;
        if !(min..=max).contains(&d.poll_interval_sec) {
            errors.push(format!(
                "dashboard: poll_interval_sec {} out of range [{min}, {max}]",
                d.poll_interval_sec
            ));
        }

        if !(d.default_history_hours.is_finite() && d.default_history_hours > 0.0) {
            errors.push(format!(
                "dashboard: default_history_hours must be positive, got {}",
                d.default_history_hours
            ));
        }

        let (min, max) = SESSION_TTL_RANGE;
        if !(min..=max).contains(&d.session_ttl_hours) {
            errors.push(format!(
                "dashboard: session_ttl_hours {} out of range [{min}, {max}]",
                d.session_ttl_hours
            ));
        }

        if parse_utc_offset(&d.display_utc_offset).is_none() {
            errors.push(format!(
                "dashboard: display_utc_offset '{}' is not of the form +HH:MM",
                d.display_utc_offset
            ));
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let Some(seed) = &self.device else {
            return;
        };

        if seed.name.trim().is_empty() {
            errors.push("device: name is empty".to_string());
        }
        if !(LOW_RANGE.0..=LOW_RANGE.1).contains(&seed.threshold_low) {
            errors.push(format!(
                "device: threshold_low {} out of range [{}, {}]",
                seed.threshold_low, LOW_RANGE.0, LOW_RANGE.1
            ));
        }
        if !(HIGH_RANGE.0..=HIGH_RANGE.1).contains(&seed.threshold_high) {
            errors.push(format!(
                "device: threshold_high {} out of range [{}, {}]",
                seed.threshold_high, HIGH_RANGE.0, HIGH_RANGE.1
            ));
        }
        if seed.threshold_low >= seed.threshold_high {
            errors.push(format!(
                "device: threshold_low ({}) must be below threshold_high ({})",
                seed.threshold_low, seed.threshold_high
            ));
        }
    }

    pub fn session_ttl(&self) -> Duration {
        let hours = self.dashboard.session_ttl_hours.clamp(SESSION_TTL_RANGE.0, SESSION_TTL_RANGE.1);
        Duration::hours(hours as i64)
    }

    /// The validated display offset; UTC if somehow unparseable.
    pub fn display_offset(&self) -> UtcOffset {
        parse_utc_offset(&self.dashboard.display_utc_offset).unwrap_or(UtcOffset::UTC)
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed the device document from `[device]` if the store has none yet.
pub async fn apply(config: &Config, devices: &Devices) -> Result<()> {
    let device_id = &config.dashboard.device_id;
    let seeded = match &config.device {
        Some(seed) => devices
            .seed_if_absent(device_id, &seed.to_device_state())
            .await
            .with_context(|| format!("failed to seed device '{device_id}'"))?,
        None => false,
    };

    tracing::info!(
        device = %device_id,
        poll_interval_sec = config.dashboard.poll_interval_sec,
        seeded,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

//! Device operations: the store's `devices/` and `history/` subtrees seen
//! through the telemetry model.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use time::OffsetDateTime;

use soil_telemetry::reading::format_timestamp;
use soil_telemetry::{
    filter_window, DeviceState, Fetched, ManualCommand, PumpMode, PumpState, Reading, Settings,
    Trigger,
};

use crate::store::{paths, Op, Store};

// ---------------------------------------------------------------------------
// Metric
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Moisture,
    Pump,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Moisture => "moisture",
            Metric::Pump => "pump",
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moisture" => Ok(Metric::Moisture),
            "pump" => Ok(Metric::Pump),
            other => Err(format!("unknown metric '{other}' (use moisture or pump)")),
        }
    }
}

/// Device ids are single path segments.
pub fn check_device_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        Err("device_id is empty".to_string())
    } else if id.contains('/') {
        Err(format!("device_id '{id}' must not contain '/'"))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Report {
    Moisture(f64),
    Pump { status: PumpState, trigger: Trigger },
}

impl Report {
    pub fn metric(&self) -> Metric {
        match self {
            Report::Moisture(_) => Metric::Moisture,
            Report::Pump { .. } => Metric::Pump,
        }
    }
}

/// One history entry sent by a device.  `extra` fields are stored with the
/// entry but cannot override `value`, `timestamp` or `trigger`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub report: Report,
    pub at: OffsetDateTime,
    pub extra: Map<String, Value>,
}

impl Sample {
    pub fn new(report: Report, at: OffsetDateTime) -> Self {
        Self {
            report,
            at,
            extra: Map::new(),
        }
    }

    fn history_entry(&self) -> Value {
        let mut entry = self.extra.clone();
        match self.report {
            Report::Moisture(value) => {
                entry.insert("value".into(), json!(value));
                entry.remove("trigger");
            }
            Report::Pump { status, trigger } => {
                entry.insert("value".into(), json!(status));
                entry.insert("trigger".into(), json!(trigger));
            }
        }
        entry.insert("timestamp".into(), json!(format_timestamp(self.at)));
        Value::Object(entry)
    }
}

/// Live fields a device may overwrite on its own document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatePatch {
    pub moisture: Option<f64>,
    pub pump_status: Option<PumpState>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Devices {
    store: Store,
}

impl Devices {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Current device document; an absent device reads as defaults.
    pub async fn snapshot(&self, device_id: &str) -> Result<DeviceState> {
        let raw = self.store.get(&paths::device(device_id)).await?;
        DeviceState::from_snapshot(raw)
            .with_context(|| format!("malformed device document: {device_id}"))
    }

    /// Write the device document only when nothing is stored yet.
    pub async fn seed_if_absent(&self, device_id: &str, seed: &DeviceState) -> Result<bool> {
        let path = paths::device(device_id);
        if self.store.get(&path).await?.is_some() {
            return Ok(false);
        }
        let doc = serde_json::to_value(seed).context("failed to encode device seed")?;
        self.store.set(&path, &doc).await?;
        tracing::info!(device = %device_id, "device document seeded");
        Ok(true)
    }

    /// Manual override: set the pump, leave auto mode, log the transition.
    pub async fn set_pump(
        &self,
        device_id: &str,
        status: PumpState,
        now: OffsetDateTime,
    ) -> Result<DeviceState> {
        let mut device = self.snapshot(device_id).await?;
        let mut control = device.control();
        ManualCommand::new(status).apply(&mut control);

        let changed = format_timestamp(now);
        let mut fields = Map::new();
        fields.insert("actuators/pump/status".into(), json!(control.status));
        fields.insert("actuators/pump/mode".into(), json!(control.mode));
        fields.insert("actuators/pump/lastChanged".into(), json!(changed));
        fields.insert("settings/autoMode".into(), json!(control.settings.auto_mode));

        // State and log commit together.
        self.store
            .batch(vec![
                Op::Update(paths::device(device_id), fields),
                Op::Push(
                    paths::history(device_id, Metric::Pump.as_str()),
                    json!({
                        "value": control.status,
                        "trigger": Trigger::Manual,
                        "timestamp": changed,
                    }),
                ),
            ])
            .await
            .with_context(|| format!("failed to set pump on {device_id}"))?;

        tracing::info!(device = %device_id, status = %control.status, "pump set manually");

        device.actuators.pump.status = control.status;
        device.actuators.pump.mode = control.mode;
        device.actuators.pump.last_changed = Some(changed);
        device.settings = control.settings;
        Ok(device)
    }

    /// Validate and store operator settings.  Rejections carry a
    /// [`soil_telemetry::policy::SettingsError`].
    pub async fn update_settings(&self, device_id: &str, settings: Settings) -> Result<()> {
        settings.thresholds.validate()?;

        let mut fields = Map::new();
        fields.insert("settings/autoMode".into(), json!(settings.auto_mode));
        fields.insert("settings/thresholds/low".into(), json!(settings.thresholds.low));
        fields.insert("settings/thresholds/high".into(), json!(settings.thresholds.high));
        fields.insert(
            "actuators/pump/mode".into(),
            json!(PumpMode::from_auto_mode(settings.auto_mode)),
        );
        self.store
            .update(&paths::device(device_id), &fields)
            .await
            .with_context(|| format!("failed to update settings on {device_id}"))?;

        tracing::info!(
            device = %device_id,
            auto_mode = settings.auto_mode,
            low = settings.thresholds.low,
            high = settings.thresholds.high,
            "settings updated"
        );
        Ok(())
    }

    /// Readings from the last `hours`, oldest first.  A store failure is
    /// reported as `Failed`, never as an empty window.
    pub async fn history(
        &self,
        device_id: &str,
        metric: Metric,
        hours: f64,
        now: OffsetDateTime,
    ) -> Fetched<Vec<Reading>> {
        let result = self
            .store
            .get(&paths::history(device_id, metric.as_str()))
            .await
            .map(|raw| {
                raw.map(|v| filter_window(&v, hours, now))
                    .unwrap_or_default()
            });

        if let Err(e) = &result {
            tracing::warn!(device = %device_id, metric = metric.as_str(), "history read failed: {e:#}");
        }
        Fetched::from_result(result)
    }

    pub async fn clear_history(&self, device_id: &str) -> Result<()> {
        self.store
            .remove(&paths::history_root(device_id))
            .await
            .with_context(|| format!("failed to clear history for {device_id}"))?;
        tracing::info!(device = %device_id, "history cleared");
        Ok(())
    }

    /// Store a device-reported sample: append it to the metric's history and
    /// mirror it into the live device document, in one transaction.  Returns
    /// the history key.
    pub async fn record_reading(
        &self,
        device_id: &str,
        sample: &Sample,
        now: OffsetDateTime,
    ) -> Result<String> {
        let at = format_timestamp(sample.at);
        let mut fields = Map::new();
        match sample.report {
            Report::Moisture(value) => {
                fields.insert("sensors/moisture".into(), json!(value));
            }
            Report::Pump { status, .. } => {
                fields.insert("actuators/pump/status".into(), json!(status));
                fields.insert("actuators/pump/lastChanged".into(), json!(at));
            }
        }
        fields.insert("info/lastSeen".into(), json!(format_timestamp(now)));

        let metric = sample.report.metric();
        let keys = self
            .store
            .batch(vec![
                Op::Push(paths::history(device_id, metric.as_str()), sample.history_entry()),
                Op::Update(paths::device(device_id), fields),
            ])
            .await
            .with_context(|| format!("failed to record {} reading on {device_id}", metric.as_str()))?;

        tracing::debug!(device = %device_id, metric = metric.as_str(), "reading recorded");
        keys.into_iter()
            .next()
            .context("history push produced no key")
    }

    /// Apply a device's live-state patch and mark it seen at `now`.
    pub async fn patch_state(
        &self,
        device_id: &str,
        patch: &StatePatch,
        now: OffsetDateTime,
    ) -> Result<()> {
        let seen = format_timestamp(now);
        let mut fields = Map::new();
        if let Some(moisture) = patch.moisture {
            fields.insert("sensors/moisture".into(), json!(moisture));
        }
        if let Some(status) = patch.pump_status {
            fields.insert("actuators/pump/status".into(), json!(status));
            fields.insert("actuators/pump/lastChanged".into(), json!(seen));
        }
        fields.insert("info/lastSeen".into(), json!(seen));

        self.store
            .update(&paths::device(device_id), &fields)
            .await
            .with_context(|| format!("failed to patch state on {device_id}"))
    }

    pub async fn log_moisture(&self, device_id: &str, value: Value, now: OffsetDateTime) -> Result<String> {
        self.store
            .push(
                &paths::history(device_id, Metric::Moisture.as_str()),
                &json!({ "value": value, "timestamp": format_timestamp(now) }),
            )
            .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use soil_telemetry::policy::SettingsError;
    use soil_telemetry::{total_runtime, Thresholds};
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    async fn devices() -> Devices {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Devices::new(store)
    }

    // -- Metric -------------------------------------------------------------

    #[test]
    fn metric_parses_known_names() {
        assert_eq!("moisture".parse::<Metric>(), Ok(Metric::Moisture));
        assert_eq!("pump".parse::<Metric>(), Ok(Metric::Pump));
        assert!("temperature".parse::<Metric>().is_err());
    }

    // -- Snapshot / seed ----------------------------------------------------

    #[tokio::test]
    async fn absent_device_reads_as_defaults() {
        let d = devices().await;
        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap, DeviceState::default());
    }

    #[tokio::test]
    async fn seed_only_when_absent() {
        let d = devices().await;
        let mut seed = DeviceState::default();
        seed.info.name = "Bed 1".into();
        assert!(d.seed_if_absent("dev1", &seed).await.unwrap());

        seed.info.name = "Bed 2".into();
        assert!(!d.seed_if_absent("dev1", &seed).await.unwrap());
        assert_eq!(d.snapshot("dev1").await.unwrap().info.name, "Bed 1");
    }

    // -- set_pump -----------------------------------------------------------

    #[tokio::test]
    async fn manual_pump_disables_auto_and_logs() {
        let d = devices().await;
        d.seed_if_absent("dev1", &DeviceState::default()).await.unwrap();

        let after = d.set_pump("dev1", PumpState::On, NOW).await.unwrap();
        assert_eq!(after.actuators.pump.status, PumpState::On);
        assert_eq!(after.actuators.pump.mode, PumpMode::Manual);
        assert!(!after.settings.auto_mode);

        let stored = d.snapshot("dev1").await.unwrap();
        assert_eq!(stored, after);
        assert_eq!(stored.actuators.pump.last_changed.as_deref(), Some("2024-01-01T12:00:00Z"));
        assert_eq!(stored.settings.thresholds, Thresholds::default());

        let Fetched::Data(log) = d.history("dev1", Metric::Pump, 24.0, NOW + Duration::minutes(1)).await
        else {
            panic!("expected pump history");
        };
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].pump_state(), PumpState::On);
        assert_eq!(log[0].trigger(), Some(Trigger::Manual));
    }

    #[tokio::test]
    async fn pump_cycle_yields_runtime() {
        let d = devices().await;
        d.set_pump("dev1", PumpState::On, NOW).await.unwrap();
        d.set_pump("dev1", PumpState::Off, NOW + Duration::minutes(10)).await.unwrap();

        let later = NOW + Duration::hours(1);
        let log = d.history("dev1", Metric::Pump, 24.0, later).await;
        assert_eq!(total_runtime(log.items().unwrap(), later), 600.0);
    }

    // -- Device reports -----------------------------------------------------

    #[test]
    fn device_ids_are_single_segments() {
        assert!(check_device_id("device_001").is_ok());
        assert_eq!(check_device_id(""), Err("device_id is empty".to_string()));
        assert!(check_device_id("a/b").unwrap_err().contains("must not contain '/'"));
    }

    #[tokio::test]
    async fn moisture_reading_updates_live_state() {
        let d = devices().await;
        let seen = NOW + Duration::seconds(2);
        d.record_reading("dev1", &Sample::new(Report::Moisture(37.5), NOW), seen)
            .await
            .unwrap();

        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap.moisture(), 37.5);
        assert_eq!(snap.info.last_seen, "2024-01-01T12:00:02Z");

        let log = d.history("dev1", Metric::Moisture, 24.0, seen).await;
        assert_eq!(log.items().unwrap()[0].moisture(), Some(37.5));
    }

    #[tokio::test]
    async fn auto_pump_reports_yield_runtime() {
        let d = devices().await;
        let on = Report::Pump { status: PumpState::On, trigger: Trigger::Auto };
        let off = Report::Pump { status: PumpState::Off, trigger: Trigger::Auto };
        d.record_reading("dev1", &Sample::new(on, NOW), NOW).await.unwrap();
        let stop = NOW + Duration::minutes(4);
        d.record_reading("dev1", &Sample::new(off, stop), stop).await.unwrap();

        let later = NOW + Duration::hours(1);
        let log = d.history("dev1", Metric::Pump, 24.0, later).await;
        let items = log.items().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|r| r.trigger() == Some(Trigger::Auto)));
        assert_eq!(total_runtime(items, later), 240.0);

        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap.actuators.pump.status, PumpState::Off);
        assert_eq!(snap.actuators.pump.last_changed.as_deref(), Some("2024-01-01T12:04:00Z"));
    }

    #[tokio::test]
    async fn sample_extras_pass_through_but_cannot_override() {
        let d = devices().await;
        let mut sample = Sample::new(Report::Moisture(41.0), NOW);
        sample.extra.insert("sensorId".into(), json!("s1"));
        sample.extra.insert("value".into(), json!(99));
        sample.extra.insert("trigger".into(), json!("AUTO"));
        d.record_reading("dev1", &sample, NOW).await.unwrap();

        let log = d.history("dev1", Metric::Moisture, 24.0, NOW + Duration::minutes(1)).await;
        let r = &log.items().unwrap()[0];
        assert_eq!(r.moisture(), Some(41.0));
        assert_eq!(r.extra.get("sensorId"), Some(&json!("s1")));
        assert_eq!(r.trigger(), None);
    }

    #[tokio::test]
    async fn bad_extra_key_writes_nothing() {
        let d = devices().await;
        let mut sample = Sample::new(Report::Moisture(41.0), NOW);
        sample.extra.insert("sensor/id".into(), json!("s1"));

        let err = d.record_reading("dev1", &sample, NOW).await.unwrap_err();
        assert!(err.downcast_ref::<crate::store::InvalidKey>().is_some());
        assert!(d.store().get("devices/dev1").await.unwrap().is_none());
        assert!(d.store().get("history/dev1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_patch_marks_device_seen() {
        let d = devices().await;
        d.seed_if_absent("dev1", &DeviceState::default()).await.unwrap();

        d.patch_state("dev1", &StatePatch::default(), NOW).await.unwrap();
        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap.info.last_seen, "2024-01-01T12:00:00Z");
        assert_eq!(snap.actuators.pump.status, PumpState::Off);

        let patch = StatePatch {
            moisture: Some(22.0),
            pump_status: Some(PumpState::On),
        };
        d.patch_state("dev1", &patch, NOW).await.unwrap();
        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap.moisture(), 22.0);
        assert_eq!(snap.actuators.pump.status, PumpState::On);
        // Patches do not touch history.
        assert_eq!(d.history("dev1", Metric::Pump, 24.0, NOW).await, Fetched::Empty);
    }

    #[test]
    fn state_patch_rejects_unknown_fields() {
        assert!(serde_json::from_value::<StatePatch>(json!({"pumpStatus": "ON"})).is_ok());
        assert!(serde_json::from_value::<StatePatch>(json!({"settings": {}})).is_err());
    }

    // -- update_settings ----------------------------------------------------

    #[tokio::test]
    async fn settings_written_with_pump_mode() {
        let d = devices().await;
        let settings = Settings {
            auto_mode: false,
            thresholds: Thresholds { low: 25.0, high: 75.0 },
        };
        d.update_settings("dev1", settings).await.unwrap();

        let snap = d.snapshot("dev1").await.unwrap();
        assert_eq!(snap.settings, settings);
        assert_eq!(snap.actuators.pump.mode, PumpMode::Manual);
    }

    #[tokio::test]
    async fn invalid_settings_rejected_without_write() {
        let d = devices().await;
        let settings = Settings {
            auto_mode: true,
            thresholds: Thresholds { low: 60.0, high: 55.0 },
        };
        let err = d.update_settings("dev1", settings).await.unwrap_err();
        assert!(err.downcast_ref::<SettingsError>().is_some());
        assert!(d.store().get("devices/dev1").await.unwrap().is_none());
    }

    // -- history ------------------------------------------------------------

    #[tokio::test]
    async fn empty_history_is_empty_not_failed() {
        let d = devices().await;
        assert_eq!(d.history("dev1", Metric::Moisture, 24.0, NOW).await, Fetched::Empty);
    }

    #[tokio::test]
    async fn history_windows_logged_moisture() {
        let d = devices().await;
        d.log_moisture("dev1", json!(40), NOW - Duration::hours(30)).await.unwrap();
        d.log_moisture("dev1", json!(45), NOW - Duration::hours(2)).await.unwrap();
        d.log_moisture("dev1", json!(50), NOW - Duration::hours(1)).await.unwrap();

        let out = d.history("dev1", Metric::Moisture, 24.0, NOW).await;
        let values: Vec<f64> = out.items().unwrap().iter().filter_map(Reading::moisture).collect();
        assert_eq!(values, vec![45.0, 50.0]);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let d = devices().await;
        d.store().pool().close().await;
        assert!(d.history("dev1", Metric::Moisture, 24.0, NOW).await.is_failed());
    }

    #[tokio::test]
    async fn clear_history_removes_both_metrics() {
        let d = devices().await;
        d.log_moisture("dev1", json!(40), NOW).await.unwrap();
        d.set_pump("dev1", PumpState::On, NOW).await.unwrap();
        d.clear_history("dev1").await.unwrap();

        assert_eq!(d.history("dev1", Metric::Moisture, 24.0, NOW).await, Fetched::Empty);
        assert_eq!(d.history("dev1", Metric::Pump, 24.0, NOW).await, Fetched::Empty);
        // The device document itself survives.
        assert!(d.store().get("devices/dev1").await.unwrap().is_some());
    }
}

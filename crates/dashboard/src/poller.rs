//! Periodic refresh of the monitored device snapshot.
//!
//! Each tick reads `devices/{id}` and caches it in [`SystemState`] so the
//! status endpoint never blocks on the store.  A failed read is recorded
//! and the loop carries on with the last good snapshot.
//!
//! [`SystemState`]: crate::state::SystemState

use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use soil_telemetry::{classify, desired_pump_state};

use crate::devices::Devices;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the poll loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(devices: Devices, device_id: String, shared: SharedState, interval_sec: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(device = %device_id, interval_sec, "poller started");
    {
        let mut st = shared.write().await;
        st.record_system(format!("polling {device_id} every {interval_sec}s"));
    }

    loop {
        ticker.tick().await;
        poll_once(&devices, &device_id, &shared, OffsetDateTime::now_utc()).await;
    }
}

/// One refresh.  Returns whether the store answered.
pub async fn poll_once(
    devices: &Devices,
    device_id: &str,
    shared: &SharedState,
    now: OffsetDateTime,
) -> bool {
    match devices.snapshot(device_id).await {
        Ok(device) => {
            let moisture = device.moisture();
            let pump = device.actuators.pump.status;
            let expected = desired_pump_state(&device.settings, pump, moisture);
            debug!(
                device = %device_id,
                moisture,
                condition = %classify(moisture),
                pump = %pump,
                "poll"
            );
            if expected != pump {
                debug!(
                    device = %device_id,
                    pump = %pump,
                    expected = %expected,
                    "device pump differs from auto policy"
                );
            }

            let mut st = shared.write().await;
            st.record_poll(device, now);
            true
        }
        Err(e) => {
            warn!(device = %device_id, "poll failed: {e:#}");
            let mut st = shared.write().await;
            st.record_poll_failure(format!("{e:#}"));
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EventKind, SystemState};
    use crate::store::Store;
    use serde_json::json;
    use soil_telemetry::PumpState;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    async fn devices() -> Devices {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        Devices::new(store)
    }

    #[tokio::test]
    async fn poll_caches_snapshot() {
        let d = devices().await;
        d.store()
            .set("devices/dev1", &json!({"sensors": {"moisture": 42}}))
            .await
            .unwrap();
        let shared = SystemState::shared();

        assert!(poll_once(&d, "dev1", &shared, NOW).await);

        let st = shared.read().await;
        assert!(st.store_reachable);
        assert_eq!(st.device.as_ref().unwrap().moisture(), 42.0);
        assert_eq!(st.last_poll, Some(NOW));
    }

    #[tokio::test]
    async fn pump_change_between_polls_is_an_event() {
        let d = devices().await;
        let shared = SystemState::shared();

        poll_once(&d, "dev1", &shared, NOW).await;
        d.set_pump("dev1", PumpState::On, NOW).await.unwrap();
        poll_once(&d, "dev1", &shared, NOW).await;

        let st = shared.read().await;
        assert!(st.events.iter().any(|e| e.kind == EventKind::Pump));
    }

    #[tokio::test]
    async fn failed_poll_keeps_running_state() {
        let d = devices().await;
        let shared = SystemState::shared();
        poll_once(&d, "dev1", &shared, NOW).await;

        d.store().pool().close().await;
        assert!(!poll_once(&d, "dev1", &shared, NOW).await);

        let st = shared.read().await;
        assert!(!st.store_reachable);
        assert!(st.device.is_some());
        assert!(st.last_error.is_some());
    }

    #[tokio::test]
    async fn malformed_document_is_a_failure() {
        let d = devices().await;
        d.store()
            .set("devices/dev1", &json!({"sensors": "broken"}))
            .await
            .unwrap();
        let shared = SystemState::shared();

        assert!(!poll_once(&d, "dev1", &shared, NOW).await);
        assert!(shared.read().await.last_error.as_deref().unwrap().contains("malformed"));
    }
}

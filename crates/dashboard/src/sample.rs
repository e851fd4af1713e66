//! Synthetic moisture history for development and demos.

use anyhow::Result;
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::devices::Devices;

const POINTS: i64 = 48;
const STEP_MIN: i64 = 30;

/// A slow drying curve: starts near 70 %, loses 0.8 per step, with ±5
/// uniform noise, clamped to 15..=85 and truncated to whole percent.
pub fn sample_series(now: OffsetDateTime, rng: &mut fastrand::Rng) -> Vec<(OffsetDateTime, i64)> {
    (0..POINTS)
        .map(|i| {
            let ts = now - Duration::minutes(STEP_MIN * (POINTS - i));
            let base = 70.0 - i as f64 * 0.8;
            let noise = rng.f64() * 10.0 - 5.0;
            let value = (base + noise).clamp(15.0, 85.0) as i64;
            (ts, value)
        })
        .collect()
}

/// Append the sample series to the device's moisture history.
pub async fn seed_moisture(
    devices: &Devices,
    device_id: &str,
    now: OffsetDateTime,
    rng: &mut fastrand::Rng,
) -> Result<usize> {
    let series = sample_series(now, rng);
    for (ts, value) in &series {
        devices.log_moisture(device_id, json!(value), *ts).await?;
    }
    tracing::info!(device = %device_id, points = series.len(), "sample moisture seeded");
    Ok(series.len())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Metric;
    use crate::store::Store;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    #[test]
    fn series_shape() {
        let mut rng = fastrand::Rng::with_seed(7);
        let s = sample_series(NOW, &mut rng);
        assert_eq!(s.len(), 48);
        assert_eq!(s[0].0, NOW - Duration::hours(24));
        assert_eq!(s[47].0, NOW - Duration::minutes(30));
        assert!(s.windows(2).all(|w| w[1].0 - w[0].0 == Duration::minutes(30)));
        assert!(s.iter().all(|(_, v)| (15..=85).contains(v)));
    }

    #[test]
    fn series_drifts_down() {
        let mut rng = fastrand::Rng::with_seed(42);
        let s = sample_series(NOW, &mut rng);
        let head: i64 = s[..8].iter().map(|(_, v)| v).sum();
        let tail: i64 = s[40..].iter().map(|(_, v)| v).sum();
        assert!(head > tail);
    }

    #[tokio::test]
    async fn seeded_points_fall_in_default_window() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        let devices = Devices::new(store);

        let mut rng = fastrand::Rng::with_seed(1);
        assert_eq!(seed_moisture(&devices, "dev1", NOW, &mut rng).await.unwrap(), 48);

        let window = devices.history("dev1", Metric::Moisture, 24.0, NOW).await;
        // The oldest point sits exactly on the cutoff and is excluded.
        assert_eq!(window.items().unwrap().len(), 47);
    }
}

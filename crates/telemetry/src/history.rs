//! Narrowing raw history to a time window.

use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::reading::Reading;

/// Upper bound on a window; anything larger is treated as "everything".
const MAX_WINDOW_HOURS: f64 = 1_000_000.0;

/// Outcome of a history query.  Keeps "nothing in the window" apart from
/// "could not read the store".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Fetched<T> {
    Data(T),
    Empty,
    Failed(String),
}

impl<T> Fetched<Vec<T>> {
    pub fn from_result<E: std::fmt::Display>(result: Result<Vec<T>, E>) -> Self {
        match result {
            Ok(v) if v.is_empty() => Fetched::Empty,
            Ok(v) => Fetched::Data(v),
            Err(e) => Fetched::Failed(format!("{e:#}")),
        }
    }

    /// The items on success (empty slice for `Empty`), `None` on failure.
    pub fn items(&self) -> Option<&[T]> {
        match self {
            Fetched::Data(v) => Some(v),
            Fetched::Empty => Some(&[]),
            Fetched::Failed(_) => None,
        }
    }
}

impl<T> Fetched<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Fetched::Failed(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        match self {
            Fetched::Data(v) => Fetched::Data(f(v)),
            Fetched::Empty => Fetched::Empty,
            Fetched::Failed(e) => Fetched::Failed(e),
        }
    }
}

/// Keep the entries of `raw` (an object of `id -> entry`) whose timestamp is
/// strictly after `now - hours`, sorted ascending by timestamp.
///
/// Entries that are not objects, have no timestamp, or whose timestamp does
/// not parse are skipped.  A non-object `raw` yields an empty window.
pub fn filter_window(raw: &Value, hours: f64, now: OffsetDateTime) -> Vec<Reading> {
    let Some(entries) = raw.as_object() else {
        return Vec::new();
    };
    if hours.is_nan() {
        return Vec::new();
    }

    let span = Duration::seconds_f64(hours.clamp(0.0, MAX_WINDOW_HOURS) * 3600.0);
    let cutoff = now.checked_sub(span);

    let mut readings: Vec<Reading> = entries
        .iter()
        .filter_map(|(key, entry)| {
            let reading = Reading::from_entry(entry);
            if reading.is_none() {
                tracing::debug!(key = %key, "skipping malformed history entry");
            }
            reading
        })
        .filter(|r| cutoff.map_or(true, |c| r.timestamp > c))
        .collect();

    readings.sort_by_key(|r| r.timestamp);
    readings
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2024-01-01 01:00:00 UTC)
    }

    // -- Windowing ----------------------------------------------------------

    #[test]
    fn keeps_only_entries_after_cutoff() {
        let raw = json!({
            "old":    {"value": 40, "timestamp": "2023-12-31T00:59:59Z"},
            "edge":   {"value": 41, "timestamp": "2023-12-31T01:00:00Z"},
            "inside": {"value": 42, "timestamp": "2023-12-31T01:00:01Z"},
        });
        let out = filter_window(&raw, 24.0, now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(42));
    }

    #[test]
    fn output_sorted_ascending() {
        let raw = json!({
            "a": {"value": 3, "timestamp": "2024-01-01T00:30:00Z"},
            "b": {"value": 1, "timestamp": "2024-01-01T00:10:00Z"},
            "c": {"value": 2, "timestamp": "2024-01-01T05:50:00+05:30"},
        });
        let out = filter_window(&raw, 24.0, now());
        let values: Vec<_> = out.iter().map(|r| r.value.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn fractional_hours_window() {
        let raw = json!({
            "a": {"value": 1, "timestamp": "2024-01-01T00:20:00Z"},
            "b": {"value": 2, "timestamp": "2024-01-01T00:40:00Z"},
        });
        let out = filter_window(&raw, 0.5, now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(2));
    }

    // -- Malformed input ----------------------------------------------------

    #[test]
    fn malformed_entries_are_skipped() {
        let raw = json!({
            "scalar": 17,
            "no_ts": {"value": 10},
            "bad_ts": {"value": 11, "timestamp": "not a time"},
            "naive": {"value": 12, "timestamp": "2024-01-01T00:30:00"},
            "ok": {"value": 13, "timestamp": "2024-01-01T00:30:00Z"},
        });
        let out = filter_window(&raw, 24.0, now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(13));
    }

    #[test]
    fn non_object_root_is_empty() {
        assert!(filter_window(&Value::Null, 24.0, now()).is_empty());
        assert!(filter_window(&json!([1, 2, 3]), 24.0, now()).is_empty());
    }

    #[test]
    fn nan_hours_is_empty() {
        let raw = json!({"a": {"value": 1, "timestamp": "2024-01-01T00:30:00Z"}});
        assert!(filter_window(&raw, f64::NAN, now()).is_empty());
    }

    #[test]
    fn infinite_hours_keeps_everything() {
        let raw = json!({"a": {"value": 1, "timestamp": "1999-01-01T00:00:00Z"}});
        assert_eq!(filter_window(&raw, f64::INFINITY, now()).len(), 1);
    }

    // -- Pass-through and purity ---------------------------------------------

    #[test]
    fn extra_fields_pass_through() {
        let raw = json!({
            "a": {"value": "ON", "trigger": "AUTO", "timestamp": "2024-01-01T00:30:00Z"},
        });
        let out = filter_window(&raw, 24.0, now());
        assert_eq!(out[0].extra.get("trigger"), Some(&json!("AUTO")));
    }

    #[test]
    fn repeated_calls_are_identical() {
        let raw = json!({
            "a": {"value": 1, "timestamp": "2024-01-01T00:30:00Z"},
            "b": {"value": 2, "timestamp": "2024-01-01T00:30:00Z"},
            "c": {"value": 3, "timestamp": "2024-01-01T00:10:00Z"},
        });
        assert_eq!(filter_window(&raw, 24.0, now()), filter_window(&raw, 24.0, now()));
    }

    // -- Fetched ------------------------------------------------------------

    #[test]
    fn fetched_distinguishes_empty_from_failure() {
        let empty: Fetched<Vec<u8>> = Fetched::from_result(Ok::<_, String>(vec![]));
        let failed: Fetched<Vec<u8>> = Fetched::from_result(Err("store offline".to_string()));
        let data: Fetched<Vec<u8>> = Fetched::from_result(Ok::<_, String>(vec![1]));

        assert_eq!(empty, Fetched::Empty);
        assert_eq!(failed, Fetched::Failed("store offline".into()));
        assert_eq!(data, Fetched::Data(vec![1]));

        assert_eq!(empty.items(), Some(&[][..]));
        assert_eq!(failed.items(), None);
        assert!(failed.is_failed());
    }

    #[test]
    fn fetched_serializes_tagged() {
        let json = serde_json::to_value(Fetched::<Vec<u8>>::Failed("boom".into())).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"], "boom");
    }
}

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::RwLock;

use soil_telemetry::DeviceState;

use crate::auth::Identity;
use crate::config::Config;
use crate::devices::Devices;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type aliases
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

/// Everything a request handler or background task needs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub devices: Devices,
    pub identity: Identity,
    pub shared: SharedState,
    pub display_offset: UtcOffset,
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub store_reachable: bool,
    pub device: Option<DeviceState>,
    pub last_poll: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Poll,
    Pump,
    Settings,
    Auth,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub store_reachable: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            store_reachable: false,
            device: None,
            last_poll: None,
            last_error: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a successful poll.  Only reachability changes and pump
    /// transitions produce events, so a steady device stays quiet.
    pub fn record_poll(&mut self, device: DeviceState, at: OffsetDateTime) {
        if !self.store_reachable {
            self.push_event(EventKind::Poll, "store reachable".to_string());
        }
        if let Some(prev) = &self.device {
            let (was, now) = (prev.actuators.pump.status, device.actuators.pump.status);
            if was != now {
                self.push_event(EventKind::Pump, format!("pump {was} -> {now}"));
            }
        }

        self.store_reachable = true;
        self.device = Some(device);
        self.last_poll = Some(at);
        self.last_error = None;
    }

    /// Record a failed poll.  The last good snapshot is kept.
    pub fn record_poll_failure(&mut self, detail: String) {
        if self.store_reachable || self.last_error.is_none() {
            self.push_event(EventKind::Error, format!("store unreachable: {detail}"));
        }
        self.store_reachable = false;
        self.last_error = Some(detail);
    }

    pub fn record_pump(&mut self, detail: String) {
        self.push_event(EventKind::Pump, detail);
    }

    pub fn record_settings(&mut self, detail: String) {
        self.push_event(EventKind::Settings, detail);
    }

    pub fn record_auth(&mut self, detail: String) {
        self.push_event(EventKind::Auth, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status block, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            store_reachable: self.store_reachable,
            last_poll: self.last_poll,
            last_error: self.last_error.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use soil_telemetry::PumpState;
    use time::macros::datetime;

    fn device(status: PumpState) -> DeviceState {
        let mut d = DeviceState::default();
        d.actuators.pump.status = status;
        d
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e25");
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_auth("second".into());
        let status = st.to_status();
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Auth);
    }

    #[test]
    fn poll_records_only_transitions() {
        let mut st = SystemState::new();
        let at = datetime!(2024-01-01 00:00:00 UTC);

        st.record_poll(device(PumpState::Off), at);
        st.record_poll(device(PumpState::Off), at);
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].kind, EventKind::Poll);

        st.record_poll(device(PumpState::On), at);
        assert_eq!(st.events.len(), 2);
        assert_eq!(st.events[1].detail, "pump OFF -> ON");
        assert_eq!(st.last_poll, Some(at));
    }

    #[test]
    fn failure_keeps_last_snapshot() {
        let mut st = SystemState::new();
        st.record_poll(device(PumpState::On), datetime!(2024-01-01 00:00:00 UTC));
        st.record_poll_failure("connection refused".into());
        st.record_poll_failure("connection refused".into());

        assert!(!st.store_reachable);
        assert!(st.device.is_some());
        assert_eq!(st.last_error.as_deref(), Some("connection refused"));
        let errors = st.events.iter().filter(|e| e.kind == EventKind::Error).count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn event_kinds_serialize_lowercase() {
        let mut st = SystemState::new();
        st.record_settings("thresholds 30/70".into());
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["events"][0]["kind"], "settings");
        assert!(json["events"][0]["ts"].as_str().unwrap().contains('T'));
    }
}

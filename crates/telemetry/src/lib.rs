//! Telemetry interpretation and runtime accounting for a soil-moisture /
//! pump device.
//!
//! Everything in this crate is a pure function over data that has already
//! been fetched from the store: no I/O, no clocks (callers pass `now`).

pub mod condition;
pub mod device;
pub mod history;
pub mod policy;
pub mod reading;
pub mod recommendation;
pub mod runtime;
pub mod stats;

pub use condition::{classify, Condition};
pub use device::{Connectivity, DeviceState};
pub use history::{filter_window, Fetched};
pub use policy::{desired_pump_state, AutoModePolicy, ManualCommand, Settings, Thresholds};
pub use reading::{parse_timestamp, PumpMode, PumpState, Reading, Trigger};
pub use recommendation::{recommend, Level, Recommendation};
pub use runtime::{format_runtime, total_runtime, RuntimeAccumulator};

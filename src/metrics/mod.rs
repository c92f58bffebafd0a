//! Telemetry counters for the proxy core
//!
//! Lock-free atomics updated from hot paths. Export format is left to the
//! embedding application; [`MetricsSnapshot`] is serde-serializable.

mod collector;
mod snapshot;

pub use collector::MetricsCollector;
pub use snapshot::{MetricsSnapshot, TargetStats};

//! Default values for configuration fields
//!
//! This module centralizes all default value functions used in serde deserialization.

use crate::types::{MaxConnections, MaxErrors};
use std::time::Duration;

/// Default listen host (all interfaces)
#[inline]
pub fn host() -> String {
    "0.0.0.0".to_string()
}

#[inline]
pub fn enabled() -> bool {
    true
}

#[inline]
pub fn pool_provider() -> String {
    "deadpool".to_string()
}

/// Default cluster-wide pool size per target
#[inline]
pub fn pool_max_size() -> MaxConnections {
    MaxConnections::DEFAULT
}

#[inline]
pub fn pool_min_idle() -> usize {
    5
}

#[inline]
pub fn acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

#[inline]
pub fn idle_timeout() -> Duration {
    Duration::from_secs(600)
}

#[inline]
pub fn max_lifetime() -> Duration {
    Duration::from_secs(1800)
}

#[inline]
pub fn maintenance_interval() -> Duration {
    Duration::from_secs(30)
}

#[inline]
pub fn slow_fraction() -> f64 {
    0.2
}

#[inline]
pub fn borrow_window() -> Duration {
    Duration::from_secs(10)
}

#[inline]
pub fn stats_refresh_interval() -> Duration {
    Duration::from_secs(300)
}

#[inline]
pub fn failure_threshold() -> MaxErrors {
    MaxErrors::DEFAULT
}

#[inline]
pub fn cool_down() -> Duration {
    Duration::from_secs(60)
}

/// Default cluster-wide XA pool size per target
#[inline]
pub fn xa_max_size() -> MaxConnections {
    MaxConnections::new(10).unwrap_or(MaxConnections::DEFAULT)
}

#[inline]
pub fn xa_min_idle() -> usize {
    2
}

#[inline]
pub fn statement_timeout() -> Duration {
    Duration::from_secs(30)
}

#[inline]
pub fn session_idle_timeout() -> Duration {
    Duration::from_secs(1800)
}

#[inline]
pub fn reap_interval() -> Duration {
    Duration::from_secs(60)
}

#[inline]
pub fn view_ttl() -> Duration {
    Duration::from_secs(30)
}

#[inline]
pub fn driver() -> String {
    "memory".to_string()
}

/// Retry forever
#[inline]
pub fn retry_attempts() -> i32 {
    -1
}

#[inline]
pub fn retry_delay() -> Duration {
    Duration::from_secs(5)
}

#[inline]
pub fn client_health_interval() -> Duration {
    Duration::from_secs(5)
}

#[inline]
pub fn client_health_threshold() -> Duration {
    Duration::from_secs(5)
}

#[inline]
pub fn client_health_timeout() -> Duration {
    Duration::from_secs(5)
}

#[inline]
pub fn max_probe_backoff() -> Duration {
    Duration::from_secs(60)
}

#[inline]
pub fn transport_timeout() -> Duration {
    Duration::from_secs(60)
}

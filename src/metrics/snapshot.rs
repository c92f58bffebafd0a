//! Metrics snapshot type and methods

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pool::PoolStatus;

/// Counters and gauges for one backend target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub target: String,
    pub acquisitions: u64,
    pub acquisition_timeouts: u64,
    pub backend_failures: u64,
    pub circuit_opened: u64,
    pub circuit_half_opened: u64,
    pub circuit_closed: u64,
    pub resizes: u64,
    pub slot_borrows: u64,
    /// Pool gauges, filled in by the node
    pub pool: Option<PoolStatus>,
}

/// Snapshot of current metrics (for display/reporting)
///
/// Cumulative counters only; rates are left to whoever consumes the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub sessions_reaped: u64,
    pub active_sessions: usize,
    pub statements: u64,
    pub xa_branches_started: u64,
    pub xa_heuristic_outcomes: u64,
    pub client_retries: u64,
    pub client_failovers: u64,
    pub uptime: Duration,
    pub targets: Vec<TargetStats>,
    /// Sessions per node as seen by one client
    pub node_sessions: Vec<(String, usize)>,
}

impl MetricsSnapshot {
    /// Attach pool gauges for each target that has a pool
    ///
    /// Targets with a pool but no recorded counters yet are added.
    #[must_use]
    pub fn with_pool_status<I>(mut self, pools: I) -> Self
    where
        I: IntoIterator<Item = (String, PoolStatus)>,
    {
        for (target, status) in pools {
            match self.targets.iter_mut().find(|t| t.target == target) {
                Some(stats) => stats.pool = Some(status),
                None => self.targets.push(TargetStats {
                    target,
                    pool: Some(status),
                    ..TargetStats::default()
                }),
            }
        }
        self.targets.sort_by(|a, b| a.target.cmp(&b.target));
        self
    }

    #[must_use]
    pub fn target(&self, name: &str) -> Option<&TargetStats> {
        self.targets.iter().find(|t| t.target == name)
    }

    /// Connections checked out across all targets
    #[must_use]
    pub fn total_in_use(&self) -> usize {
        self.targets
            .iter()
            .filter_map(|t| t.pool.map(|p| p.in_use))
            .sum()
    }

    /// Format uptime as a human-readable string
    #[must_use]
    pub fn format_uptime(&self) -> String {
        let secs = self.uptime.as_secs();
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;

        if hours > 0 {
            format!("{hours}h {minutes}m {seconds}s")
        } else if minutes > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{seconds}s")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_pool_status_merges_and_adds() {
        let snap = MetricsSnapshot {
            targets: vec![TargetStats {
                target: "orders".into(),
                acquisitions: 4,
                ..TargetStats::default()
            }],
            ..MetricsSnapshot::default()
        };
        let status = PoolStatus {
            max_size: 10,
            size: 3,
            idle: 1,
            in_use: 2,
            waiting: 0,
        };
        let snap = snap.with_pool_status(vec![
            ("orders".to_string(), status),
            ("billing".to_string(), status),
        ]);
        assert_eq!(snap.targets.len(), 2);
        assert_eq!(snap.targets[0].target, "billing");
        assert_eq!(snap.target("orders").unwrap().acquisitions, 4);
        assert_eq!(snap.total_in_use(), 4);
    }

    #[test]
    fn test_format_uptime() {
        let mut snap = MetricsSnapshot {
            uptime: Duration::from_secs(42),
            ..MetricsSnapshot::default()
        };
        assert_eq!(snap.format_uptime(), "42s");
        snap.uptime = Duration::from_secs(3723);
        assert_eq!(snap.format_uptime(), "1h 2m 3s");
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&MetricsSnapshot::default()).unwrap();
        assert!(json.contains("sessions_opened"));
    }
}

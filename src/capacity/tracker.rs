//! Change detection for client health reports

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::types::{ClientId, ConnHash};

/// Last health string each client reported for each target
#[derive(Debug, Default)]
pub struct ClusterHealthTracker {
    last_known: DashMap<(ConnHash, ClientId), String>,
}

impl ClusterHealthTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `report` and say whether it differs from the previous one
    ///
    /// The first report from a client for a target always counts as a change.
    pub fn has_health_changed(&self, conn_hash: &ConnHash, client: ClientId, report: &str) -> bool {
        match self.last_known.entry((conn_hash.clone(), client)) {
            Entry::Occupied(mut last) => {
                if last.get() == report {
                    return false;
                }
                info!(conn_hash = %conn_hash, client = %client, from = %last.get(), to = report, "Cluster health changed");
                last.insert(report.to_string());
            }
            Entry::Vacant(slot) => {
                info!(conn_hash = %conn_hash, client = %client, health = report, "First cluster health report");
                slot.insert(report.to_string());
            }
        }
        true
    }

    #[must_use]
    pub fn last_known(&self, conn_hash: &ConnHash, client: ClientId) -> Option<String> {
        self.last_known
            .get(&(conn_hash.clone(), client))
            .map(|r| r.value().clone())
    }

    /// Forget one client's report for a target
    pub fn forget(&self, conn_hash: &ConnHash, client: ClientId) {
        if self.last_known.remove(&(conn_hash.clone(), client)).is_some() {
            debug!(conn_hash = %conn_hash, client = %client, "Stopped tracking client health");
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_known.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_known.is_empty()
    }

    /// Forget every report for a target
    pub fn remove_tracking(&self, conn_hash: &ConnHash) {
        self.last_known.retain(|(hash, _), _| hash != conn_hash);
        debug!(conn_hash = %conn_hash, "Removed cluster health tracking");
    }
}

//! Cluster-aware pool sizing
//!
//! Nodes never talk to each other. Clients relay their view of the cluster
//! with every request, the node tracks those views per target and resizes its
//! pools to its share of the configured totals.

mod coordinator;
mod health_report;
mod tracker;

pub use coordinator::{CapacityShare, CapacityTotals, PoolCapacityCoordinator, share_of};
pub use health_report::{ClusterHealth, NodeStatus};
pub use tracker::ClusterHealthTracker;

//! Per-node share of a cluster-wide pool size
//!
//! Each target is configured with totals for the whole cluster. A node takes
//! `total / healthy` connections, and the first `total % healthy` healthy nodes
//! in configured order take one extra, so the shares add up to the total.
//! Every recomputation starts from the current client views; nothing is
//! patched incrementally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::ClusterHealth;
use crate::metrics::MetricsCollector;
use crate::pool::BackendPool;
use crate::segregation::Segregator;
use crate::types::ClientId;

/// Cluster-wide sizes configured for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityTotals {
    pub max_size: usize,
    pub min_idle: usize,
    pub xa_max_size: usize,
    pub xa_min_idle: usize,
}

/// This node's part of the totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapacityShare {
    pub healthy_nodes: usize,
    pub max_size: usize,
    pub min_idle: usize,
    pub xa_max_size: usize,
    pub xa_min_idle: usize,
}

/// Share of `total` for the node at `rank` among `healthy` nodes
///
/// A node missing from the healthy list takes the rounded-up share. Zero
/// healthy nodes count as one.
#[must_use]
pub fn share_of(total: usize, healthy: usize, rank: Option<usize>) -> usize {
    let healthy = healthy.max(1);
    let base = total / healthy;
    let remainder = total % healthy;
    match rank {
        Some(rank) if rank < healthy => base + usize::from(rank < remainder),
        _ => base + usize::from(remainder > 0),
    }
}

impl CapacityShare {
    /// Share of `totals` for `self_address` under `health`
    #[must_use]
    pub fn compute(totals: &CapacityTotals, health: &ClusterHealth, self_address: &str) -> Self {
        let healthy = health.healthy_count().max(1);
        let rank = health.healthy_rank(self_address);
        let max_size = share_of(totals.max_size, healthy, rank).max(1);
        let xa_max_size = share_of(totals.xa_max_size, healthy, rank).max(1);
        Self {
            healthy_nodes: healthy,
            max_size,
            min_idle: share_of(totals.min_idle, healthy, rank).min(max_size),
            xa_max_size,
            xa_min_idle: share_of(totals.xa_min_idle, healthy, rank).min(xa_max_size),
        }
    }
}

#[derive(Debug, Clone)]
struct ClientView {
    health: ClusterHealth,
    seen_at: Instant,
}

/// Keeps one target's pools sized to this node's share of the cluster
#[derive(Debug)]
pub struct PoolCapacityCoordinator {
    target: String,
    self_address: String,
    totals: CapacityTotals,
    view_ttl: Duration,
    views: Mutex<HashMap<ClientId, ClientView>>,
    /// Clients whose views lapsed since the last [`Self::drain_expired`]
    expired: Mutex<Vec<ClientId>>,
    current: Mutex<CapacityShare>,
    pool: Arc<dyn BackendPool>,
    xa_pool: Option<Arc<dyn BackendPool>>,
    segregator: Option<Arc<Segregator>>,
    metrics: Option<MetricsCollector>,
}

impl PoolCapacityCoordinator {
    pub fn new(
        target: impl Into<String>,
        self_address: impl Into<String>,
        totals: CapacityTotals,
        view_ttl: Duration,
        pool: Arc<dyn BackendPool>,
        initial: CapacityShare,
    ) -> Self {
        Self {
            target: target.into(),
            self_address: self_address.into(),
            totals,
            view_ttl,
            views: Mutex::new(HashMap::new()),
            expired: Mutex::new(Vec::new()),
            current: Mutex::new(initial),
            pool,
            xa_pool: None,
            segregator: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_xa_pool(mut self, xa_pool: Arc<dyn BackendPool>) -> Self {
        self.xa_pool = Some(xa_pool);
        self
    }

    #[must_use]
    pub fn with_segregator(mut self, segregator: Arc<Segregator>) -> Self {
        self.segregator = Some(segregator);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn totals(&self) -> CapacityTotals {
        self.totals
    }

    #[must_use]
    pub fn current(&self) -> CapacityShare {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a client's new view and rebalance
    ///
    /// Returns the new share when the pools were resized.
    pub fn update_view(&self, client: ClientId, health: ClusterHealth) -> Option<CapacityShare> {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                client,
                ClientView {
                    health,
                    seen_at: Instant::now(),
                },
            );
        self.rebalance()
    }

    /// A client reported the same view again
    ///
    /// `reported` rebuilds the view when it already lapsed, so a client that
    /// outlived the TTL without changing its report keeps counting.
    pub fn touch(
        &self,
        client: ClientId,
        reported: impl FnOnce() -> ClusterHealth,
    ) -> Option<CapacityShare> {
        {
            let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            match views.get_mut(&client) {
                Some(view) => view.seen_at = now,
                None => {
                    debug!(target_name = %self.target, client = %client, "Restoring lapsed client view");
                    views.insert(
                        client,
                        ClientView {
                            health: reported(),
                            seen_at: now,
                        },
                    );
                }
            }
        }
        self.rebalance()
    }

    /// Drop a client's view once its last session on this target closed
    pub fn forget_client(&self, client: ClientId) -> bool {
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client)
            .is_some()
    }

    #[must_use]
    pub fn view_count(&self) -> usize {
        self.views.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Clients whose views expired since the last call
    pub fn drain_expired(&self) -> Vec<ClientId> {
        std::mem::take(&mut *self.expired.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Freshest view reporting the most healthy nodes
    fn effective_view(&self) -> Option<ClusterHealth> {
        let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.view_ttl;
        let mut lapsed = Vec::new();
        views.retain(|client, view| {
            let fresh = view.seen_at.elapsed() <= ttl;
            if !fresh {
                lapsed.push(*client);
            }
            fresh
        });
        if !lapsed.is_empty() {
            debug!(target_name = %self.target, lapsed = lapsed.len(), "Expired client views");
            self.expired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(lapsed);
        }
        views
            .values()
            .max_by(|a, b| {
                a.health
                    .healthy_count()
                    .cmp(&b.health.healthy_count())
                    .then(a.seen_at.cmp(&b.seen_at))
            })
            .map(|view| view.health.clone())
    }

    /// Recompute the share from current views and resize on change
    pub fn rebalance(&self) -> Option<CapacityShare> {
        let health = self.effective_view()?;
        let share = CapacityShare::compute(&self.totals, &health, &self.self_address);

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == share {
            debug!(target_name = %self.target, healthy = share.healthy_nodes, "Pool share unchanged");
            return None;
        }
        info!(
            target_name = %self.target,
            healthy = share.healthy_nodes,
            from_max = current.max_size,
            max_size = share.max_size,
            min_idle = share.min_idle,
            xa_max_size = share.xa_max_size,
            "Rebalancing pool capacity"
        );
        self.pool.resize(share.max_size, share.min_idle);
        if let Some(xa_pool) = &self.xa_pool {
            xa_pool.resize(share.xa_max_size, share.xa_min_idle);
        }
        if let Some(segregator) = &self.segregator {
            segregator.resize(share.max_size);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_pool_resize(&self.target);
        }
        *current = share;
        Some(share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendTarget, MemoryDriver};
    use crate::pool::DirectBackendPool;

    const TOTALS: CapacityTotals = CapacityTotals {
        max_size: 30,
        min_idle: 6,
        xa_max_size: 10,
        xa_min_idle: 2,
    };

    fn coordinator(address: &str) -> (Arc<DirectBackendPool>, PoolCapacityCoordinator) {
        let pool = Arc::new(DirectBackendPool::new(
            Arc::new(MemoryDriver::new("memory")),
            BackendTarget::new("orders", "mem://orders"),
            30,
        ));
        let initial = CapacityShare::compute(&TOTALS, &ClusterHealth::default(), address);
        let coordinator = PoolCapacityCoordinator::new(
            "orders",
            address,
            TOTALS,
            Duration::from_secs(30),
            pool.clone(),
            initial,
        );
        (pool, coordinator)
    }

    #[test]
    fn test_share_arithmetic() {
        assert_eq!(share_of(30, 3, Some(0)), 10);
        assert_eq!(share_of(30, 2, Some(1)), 15);
        assert_eq!(share_of(10, 3, Some(0)), 4);
        assert_eq!(share_of(10, 3, Some(1)), 3);
        assert_eq!(share_of(10, 3, Some(2)), 3);
        assert_eq!(share_of(10, 3, None), 4);
        assert_eq!(share_of(10, 0, None), 10);
    }

    #[test]
    fn test_min_idle_never_exceeds_max() {
        let totals = CapacityTotals {
            max_size: 2,
            min_idle: 5,
            xa_max_size: 1,
            xa_min_idle: 1,
        };
        let health = ClusterHealth::parse("a:1(UP);b:1(UP)");
        let share = CapacityShare::compute(&totals, &health, "b:1");
        assert_eq!(share.max_size, 1);
        assert!(share.min_idle <= share.max_size);
    }

    #[tokio::test]
    async fn test_node_loss_grows_share() {
        let (pool, coordinator) = coordinator("a:1");
        let client = ClientId::new();

        let share = coordinator
            .update_view(client, ClusterHealth::parse("a:1(UP);b:1(UP);c:1(UP)"))
            .unwrap();
        assert_eq!(share.max_size, 10);
        assert_eq!(pool.status().max_size, 10);

        let share = coordinator
            .update_view(client, ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)"))
            .unwrap();
        assert_eq!(share.max_size, 15);
        assert_eq!(pool.status().max_size, 15);

        // Same view again: nothing to do
        assert!(
            coordinator
                .touch(client, || ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)"))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_split_views_use_most_healthy() {
        let (_pool, coordinator) = coordinator("a:1");
        coordinator.update_view(ClientId::new(), ClusterHealth::parse("a:1(UP);b:1(UP);c:1(UP)"));
        coordinator.update_view(ClientId::new(), ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)"));
        assert_eq!(coordinator.current().max_size, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_views_expire() {
        let (_pool, coordinator) = coordinator("a:1");
        let optimistic = ClientId::new();
        let pessimistic = ClientId::new();
        coordinator.update_view(optimistic, ClusterHealth::parse("a:1(UP);b:1(UP);c:1(UP)"));
        coordinator.update_view(pessimistic, ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)"));
        assert_eq!(coordinator.current().max_size, 10);

        let pessimistic_view = || ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)");
        tokio::time::advance(Duration::from_secs(20)).await;
        coordinator.touch(pessimistic, pessimistic_view);
        tokio::time::advance(Duration::from_secs(20)).await;
        coordinator.touch(pessimistic, pessimistic_view);
        assert_eq!(coordinator.current().max_size, 15);
        assert_eq!(coordinator.drain_expired(), vec![optimistic]);
        assert!(coordinator.drain_expired().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_report_restores_lapsed_view() {
        let (_pool, coordinator) = coordinator("a:1");
        let steady = ClientId::new();
        let flapping = ClientId::new();
        let all_up = || ClusterHealth::parse("a:1(UP);b:1(UP);c:1(UP)");
        coordinator.update_view(steady, all_up());
        coordinator.update_view(flapping, ClusterHealth::parse("a:1(UP);b:1(UP);c:1(DOWN)"));
        assert_eq!(coordinator.current().max_size, 10);

        tokio::time::advance(Duration::from_secs(31)).await;
        coordinator.update_view(flapping, ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(DOWN)"));
        assert_eq!(coordinator.drain_expired(), vec![steady]);
        assert_eq!(coordinator.current().max_size, 30);

        // The steady client repeats its report; its view counts again
        coordinator.touch(steady, all_up);
        assert_eq!(coordinator.view_count(), 2);
        assert_eq!(coordinator.current().max_size, 10);
    }

    #[tokio::test]
    async fn test_forgotten_client_no_longer_counts() {
        let (_pool, coordinator) = coordinator("a:1");
        let leaving = ClientId::new();
        let staying = ClientId::new();
        coordinator.update_view(leaving, ClusterHealth::parse("a:1(UP);b:1(UP);c:1(UP)"));
        coordinator.update_view(staying, ClusterHealth::parse("a:1(UP);b:1(DOWN);c:1(UP)"));
        assert_eq!(coordinator.current().max_size, 10);

        assert!(coordinator.forget_client(leaving));
        assert!(!coordinator.forget_client(leaving));
        assert_eq!(coordinator.rebalance().unwrap().max_size, 15);
    }
}

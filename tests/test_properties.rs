//! Property-based tests for capacity arithmetic, slot sizing and the breaker

use ojp_proxy::capacity::{CapacityShare, CapacityTotals, ClusterHealth, NodeStatus, share_of};
use ojp_proxy::health::{CircuitBreaker, CircuitState};
use ojp_proxy::segregation::slow_slots_for;
use proptest::prelude::*;
use std::time::Duration;

fn health(up: &[bool]) -> ClusterHealth {
    ClusterHealth::from_nodes(up.iter().enumerate().map(|(i, up)| NodeStatus {
        address: format!("node-{i}:1059"),
        up: *up,
    }))
}

proptest! {
    /// Healthy nodes' shares always add up to the configured total
    #[test]
    fn prop_shares_sum_to_total(total in 0usize..500, healthy in 1usize..12) {
        let shares: Vec<usize> = (0..healthy).map(|rank| share_of(total, healthy, Some(rank))).collect();
        prop_assert_eq!(shares.iter().sum::<usize>(), total);

        let max = *shares.iter().max().unwrap();
        let min = *shares.iter().min().unwrap();
        prop_assert!(max - min <= 1);
        // Extra connections go to the first nodes in configured order
        prop_assert!(shares.windows(2).all(|w| w[0] >= w[1]));
    }

    /// A node outside the healthy list never takes less than any healthy node
    #[test]
    fn prop_unlisted_node_rounds_up(total in 0usize..500, healthy in 0usize..12) {
        let unlisted = share_of(total, healthy, None);
        let top = share_of(total, healthy, Some(0));
        prop_assert_eq!(unlisted, top);
        prop_assert_eq!(unlisted, total.div_ceil(healthy.max(1)));
    }

    #[test]
    fn prop_cluster_shares_cover_totals(
        max_size in 8usize..200,
        min_idle in 0usize..50,
        up in prop::collection::vec(any::<bool>(), 1..8),
    ) {
        prop_assume!(up.iter().any(|u| *u));
        prop_assume!(min_idle <= max_size);
        let totals = CapacityTotals {
            max_size,
            min_idle,
            xa_max_size: max_size,
            xa_min_idle: min_idle,
        };
        let report = health(&up);
        let shares: Vec<CapacityShare> = up
            .iter()
            .enumerate()
            .filter(|(_, up)| **up)
            .map(|(i, _)| CapacityShare::compute(&totals, &report, &format!("node-{i}:1059")))
            .collect();

        prop_assert_eq!(shares.iter().map(|s| s.max_size).sum::<usize>(), max_size);
        prop_assert_eq!(shares.iter().map(|s| s.min_idle).sum::<usize>(), min_idle);
        let healthy = up.iter().filter(|u| **u).count();
        prop_assert!(shares.iter().all(|s| s.healthy_nodes == healthy));
    }

    #[test]
    fn prop_health_report_survives_formatting(up in prop::collection::vec(any::<bool>(), 0..10)) {
        let report = health(&up);
        prop_assert_eq!(ClusterHealth::parse(&report.to_string()), report);
    }

    /// The slow partition holds at least one slot and at most all of them
    #[test]
    fn prop_slow_slots_bounded(total in 1usize..1000, fraction in 0.0f64..=1.0) {
        let slow = slow_slots_for(total, fraction);
        prop_assert!(slow >= 1);
        prop_assert!(slow <= total);
        let floor = (total as f64 * fraction).floor() as usize;
        prop_assert_eq!(slow, floor.clamp(1, total));
    }

    /// The breaker opens exactly when consecutive failures reach the threshold
    #[test]
    fn prop_breaker_follows_consecutive_failures(
        threshold in 1u32..6,
        outcomes in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let breaker = CircuitBreaker::new("prop", threshold, Duration::from_secs(3600));
        let mut failures = 0u32;
        for succeeded in outcomes {
            if failures >= threshold {
                prop_assert_eq!(breaker.state(), CircuitState::Open);
                prop_assert!(breaker.try_acquire().is_err());
                continue;
            }
            let permit = breaker.try_acquire().unwrap();
            if succeeded {
                permit.success();
                failures = 0;
            } else {
                permit.failure();
                failures += 1;
            }
            prop_assert_eq!(breaker.consecutive_failures(), failures);
            let expected = if failures >= threshold { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(breaker.state(), expected);
        }
    }
}

#[test]
fn test_zero_slots_have_no_slow_partition() {
    assert_eq!(slow_slots_for(0, 0.2), 0);
}

#[test]
fn test_documented_splits() {
    assert_eq!(share_of(20, 3, Some(0)), 7);
    assert_eq!(share_of(20, 3, Some(1)), 7);
    assert_eq!(share_of(20, 3, Some(2)), 6);
    assert_eq!(share_of(30, 2, Some(1)), 15);
    assert_eq!(slow_slots_for(10, 0.2), 2);
    assert_eq!(slow_slots_for(3, 0.2), 1);
}

//! Pool sizes follow the cluster health reported by clients


use ojp_proxy::pool::BackendPool;
use ojp_proxy::types::{MaxConnections, NodeId};
use std::time::Duration;
use test_helpers::cluster_with;

const NODES: [&str; 3] = ["n1:1059", "n2:1059", "n3:1059"];

fn three_nodes() -> test_helpers::TestCluster {
    cluster_with(&NODES, |config| {
        config.pool.max_size = MaxConnections::new(30).unwrap();
    })
}

#[tokio::test]
async fn test_surviving_nodes_grow_when_one_goes_down() {
    let cluster = three_nodes();
    let router = cluster.router();

    let sessions: Vec<_> = {
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(router.open_session().await.unwrap());
        }
        ids
    };
    for node in 0..3 {
        assert_eq!(cluster.target(node).pool_status().max_size, 10);
    }

    cluster.transport.cut("n2:1059");
    // The client only learns about the outage by talking to the node
    let moved = sessions[1];
    router.execute(moved, "select 1", &[], 10).await.unwrap();
    assert!(!router.nodes()[1].is_healthy());
    assert_ne!(router.node_of(moved), Some(NodeId::from_index(1)));
    assert_eq!(
        router.cluster_health(),
        "n1:1059(UP);n2:1059(DOWN);n3:1059(UP)"
    );

    // Every node that hears the new report takes half of the total
    router.execute(sessions[0], "select 1", &[], 10).await.unwrap();
    router.execute(sessions[2], "select 1", &[], 10).await.unwrap();
    assert_eq!(cluster.target(0).pool_status().max_size, 15);
    assert_eq!(cluster.target(2).pool_status().max_size, 15);

    let share = cluster.target(0).coordinator().current();
    assert_eq!(share.healthy_nodes, 2);
    assert_eq!(share.max_size, 15);
}

#[tokio::test]
async fn test_recovered_node_shrinks_others_back() {
    let cluster = three_nodes();
    let router = cluster.router();
    let on_n1 = router.open_session().await.unwrap();
    let on_n2 = router.open_session().await.unwrap();
    router.open_session().await.unwrap();

    cluster.transport.cut("n2:1059");
    router.execute(on_n2, "select 1", &[], 10).await.unwrap();
    router.execute(on_n1, "select 1", &[], 10).await.unwrap();
    assert_eq!(cluster.target(0).pool_status().max_size, 15);

    cluster.transport.restore("n2:1059");
    assert_eq!(router.probe_unhealthy().await, 1);
    assert!(router.nodes()[1].is_healthy());

    router.execute(on_n1, "select 1", &[], 10).await.unwrap();
    assert_eq!(cluster.target(0).pool_status().max_size, 10);
}

#[tokio::test]
async fn test_shrink_holds_pooled_checkouts_to_new_share() {
    let cluster = cluster_with(&NODES, |config| {
        config.pool.provider = "deadpool".to_string();
        config.pool.max_size = MaxConnections::new(30).unwrap();
    });
    let router = cluster.router();
    let on_n1 = router.open_session().await.unwrap();
    let on_n2 = router.open_session().await.unwrap();
    router.open_session().await.unwrap();

    cluster.transport.cut("n2:1059");
    router.execute(on_n2, "select 1", &[], 10).await.unwrap();
    router.execute(on_n1, "select 1", &[], 10).await.unwrap();
    let target = cluster.target(0);
    assert_eq!(target.pool_status().max_size, 15);

    let pool = target.segregator().pool().clone();
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire(Duration::from_secs(1)).await.unwrap());
    }

    cluster.transport.restore("n2:1059");
    assert_eq!(router.probe_unhealthy().await, 1);
    router.execute(on_n1, "select 1", &[], 10).await.unwrap();
    assert_eq!(target.pool_status().max_size, 10);

    while let Ok(lease) = pool.acquire(Duration::from_millis(50)).await {
        held.push(lease);
        assert!(held.len() <= 10, "checked out {} with max 10", held.len());
    }
    assert_eq!(held.len(), 10);
    let status = target.pool_status();
    assert_eq!(status.in_use, 10);
    assert!(status.size <= 10);

    drop(held);
    assert_eq!(target.pool_status().in_use, 0);
}

#[tokio::test]
async fn test_unchanged_report_keeps_pool_size() {
    let cluster = three_nodes();
    let router = cluster.router();
    let id = router.open_session().await.unwrap();
    for _ in 0..5 {
        router.execute(id, "select 1", &[], 10).await.unwrap();
    }
    assert_eq!(cluster.target(0).pool_status().max_size, 10);
    assert_eq!(cluster.target(0).coordinator().current().healthy_nodes, 3);
}

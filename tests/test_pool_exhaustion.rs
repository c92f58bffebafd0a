//! Pool exhaustion surfaces as a timeout instead of an unbounded wait


use ojp_proxy::ProxyError;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::cluster_with;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_sixth_request_times_out_when_five_connections_are_busy() {
    let cluster = cluster_with(&["solo:1059"], |config| {
        config.pool.max_size = ojp_proxy::types::MaxConnections::new(5).unwrap();
        config.pool.acquire_timeout = Duration::from_secs(1);
        config.segregation.enabled = false;
    });
    let router = Arc::new(cluster.router());

    let mut long_running = Vec::new();
    for _ in 0..5 {
        let router = router.clone();
        let id = router.open_session().await.unwrap();
        long_running.push(tokio::spawn(async move {
            router.execute(id, "sleep 5000", &[], 10).await
        }));
    }
    // Let all five statements take their connections
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = cluster.target(0).pool_status();
    assert_eq!(status.max_size, 5);
    assert_eq!(status.in_use, 5);

    let sixth = router.open_session().await.unwrap();
    let started = Instant::now();
    let err = router.execute(sixth, "select 1", &[], 10).await.unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_pool_timeout(), "{err:?}");
    assert!(matches!(err, ProxyError::PoolExhaustedTimeout { .. }));
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_millis(1100));

    // The failure belongs to the node, so the client keeps using it
    assert!(router.nodes()[0].is_healthy());
    assert_eq!(router.node_of(sixth), Some(ojp_proxy::types::NodeId::from_index(0)));

    for handle in long_running {
        assert!(handle.await.unwrap().is_ok());
    }
    assert!(router.execute(sixth, "select 1", &[], 10).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_released_connection_unblocks_waiter() {
    let cluster = cluster_with(&["solo:1059"], |config| {
        config.pool.max_size = ojp_proxy::types::MaxConnections::new(1).unwrap();
        config.pool.acquire_timeout = Duration::from_secs(5);
        config.segregation.enabled = false;
    });
    let router = Arc::new(cluster.router());

    let busy = router.open_session().await.unwrap();
    let holder = {
        let router = router.clone();
        tokio::spawn(async move { router.execute(busy, "sleep 2000", &[], 10).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiter = router.open_session().await.unwrap();
    let started = Instant::now();
    router.execute(waiter, "select 1", &[], 10).await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(1900), "{waited:?}");
    assert!(waited < Duration::from_secs(5));
    assert!(holder.await.unwrap().is_ok());
}

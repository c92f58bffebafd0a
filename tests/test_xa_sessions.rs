//! XA branches driven end to end through the router


use ojp_proxy::ProxyError;
use ojp_proxy::xa::{EndFlag, StartFlag, XaVote, Xid};
use test_helpers::cluster;

fn xid(n: u8) -> Xid {
    Xid::new(0x4f4a, vec![n; 4], vec![1])
}

#[tokio::test]
async fn test_branches_share_one_backend_connection() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();

    let mut handles = Vec::new();
    for n in 1..=3 {
        let x = xid(n);
        router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap();
        let result = router
            .execute(id, &format!("insert branch {n}"), &[], 10)
            .await
            .unwrap();
        handles.push(result.connection);
        router.xa_end(id, &x, EndFlag::Success).await.unwrap();
        assert_eq!(router.xa_prepare(id, &x).await.unwrap(), XaVote::Ok);
        router.xa_commit(id, &x, false).await.unwrap();
    }

    assert!(handles.windows(2).all(|w| w[0] == w[1]));
    assert!(cluster.target(0).xa_registry().is_empty());
    assert_eq!(cluster.driver.connect_count(), 1);
    assert_eq!(
        cluster.driver.committed(),
        vec!["insert branch 1", "insert branch 2", "insert branch 3"]
    );
}

#[tokio::test]
async fn test_read_only_branch_needs_no_commit() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();
    let x = xid(1);

    router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap();
    router.xa_end(id, &x, EndFlag::Success).await.unwrap();
    assert_eq!(router.xa_prepare(id, &x).await.unwrap(), XaVote::ReadOnly);

    // The branch is finished, so a new one can start straight away
    router.xa_start(id, &xid(2), StartFlag::NoFlags).await.unwrap();
}

#[tokio::test]
async fn test_prepared_branch_is_recoverable_after_close() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();
    let x = xid(7);

    router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap();
    router.execute(id, "insert pending", &[], 10).await.unwrap();
    router.xa_end(id, &x, EndFlag::Success).await.unwrap();
    router.xa_prepare(id, &x).await.unwrap();
    router.close_session(id).await;

    let recovery = router.open_xa_session().await.unwrap();
    assert_eq!(router.xa_recover(recovery).await.unwrap(), vec![x.clone()]);
    router.xa_commit(recovery, &x, false).await.unwrap();
    assert_eq!(cluster.driver.committed(), vec!["insert pending"]);
    assert!(router.xa_recover(recovery).await.unwrap().is_empty());

    router.close_session(recovery).await;
    assert_eq!(cluster.target(0).xa_registry().len(), 0);
}

#[tokio::test]
async fn test_failed_prepare_reports_heuristic_outcome() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();
    let x = xid(3);

    router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap();
    router.execute(id, "insert doomed", &[], 10).await.unwrap();
    router.xa_end(id, &x, EndFlag::Success).await.unwrap();
    cluster.driver.set_fail_prepare(true);

    let err = router.xa_prepare(id, &x).await.unwrap_err();
    assert!(
        matches!(err, ProxyError::HeuristicXaOutcome { ref phase, .. } if phase == "prepare"),
        "{err:?}"
    );
    // The node stays usable; the failure was the resource manager's
    assert!(router.nodes()[0].is_healthy());
    router.xa_forget(id, &x).await.unwrap();
    assert!(cluster.driver.committed().is_empty());
}

#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();
    let x = xid(1);
    router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap();
    router.xa_end(id, &x, EndFlag::Success).await.unwrap();

    let err = router.xa_start(id, &x, StartFlag::NoFlags).await.unwrap_err();
    assert!(err.xa_code().is_some(), "{err:?}");
}

#[tokio::test]
async fn test_transaction_timeout_round_trips() {
    let cluster = cluster(&["xa:1059"]);
    let router = cluster.router();
    let id = router.open_xa_session().await.unwrap();
    router
        .xa_set_transaction_timeout(id, std::time::Duration::from_secs(45))
        .await
        .unwrap();
    assert_eq!(
        router.xa_transaction_timeout(id).await.unwrap(),
        std::time::Duration::from_secs(45)
    );
}

//! Client failover across nodes reached over TCP


use ojp_proxy::node::NodeServer;
use ojp_proxy::types::NodeId;
use ojp_proxy::{MultinodeRouter, ProxyError, ProxyNode, TcpTransport};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{client_config, node_config};

struct TcpCluster {
    nodes: Vec<Arc<ProxyNode>>,
    url: String,
}

async fn tcp_cluster(count: usize) -> TcpCluster {
    let mut nodes = Vec::new();
    let mut addresses = Vec::new();
    for i in 0..count {
        let node = ProxyNode::builder(node_config(10))
            .address(format!("tcp-{i}"))
            .build();
        let server = NodeServer::bind(node.clone(), "127.0.0.1:0").await.unwrap();
        addresses.push(server.local_addr().unwrap().to_string());
        tokio::spawn(server.run());
        nodes.push(node);
    }
    TcpCluster {
        nodes,
        url: format!("jdbc:ojp[{}]_mem://orders", addresses.join(",")),
    }
}

fn router(cluster: &TcpCluster) -> MultinodeRouter {
    MultinodeRouter::new(
        &cluster.url,
        client_config(),
        Arc::new(TcpTransport::new(Duration::from_secs(2))),
    )
    .unwrap()
}

#[tokio::test]
async fn test_idle_session_moves_to_surviving_node() {
    let cluster = tcp_cluster(2).await;
    let router = router(&cluster);
    let id = router.open_session().await.unwrap();
    assert_eq!(router.node_of(id), Some(NodeId::from_index(0)));
    router.execute(id, "insert before", &[], 10).await.unwrap();

    cluster.nodes[0].shutdown().await;
    let result = router.execute(id, "insert after", &[], 10).await.unwrap();
    assert_eq!(result.update_count, Some(1));
    assert_eq!(router.node_of(id), Some(NodeId::from_index(1)));
    assert!(!router.nodes()[0].is_healthy());
    assert_eq!(cluster.nodes[1].sessions().len(), 1);
}

#[tokio::test]
async fn test_open_transaction_fails_instead_of_moving() {
    let cluster = tcp_cluster(2).await;
    let router = router(&cluster);
    let id = router.open_session().await.unwrap();
    router.begin(id).await.unwrap();
    router.execute(id, "insert a", &[], 10).await.unwrap();

    cluster.nodes[0].shutdown().await;
    let err = router.execute(id, "insert b", &[], 10).await.unwrap_err();
    assert!(matches!(err, ProxyError::TransactionState { .. }), "{err:?}");
    assert!(cluster.nodes[1].sessions().is_empty());

    // New work still goes to the surviving node
    let next = router.open_session().await.unwrap();
    assert_eq!(router.node_of(next), Some(NodeId::from_index(1)));
    router.begin(next).await.unwrap();
    router.execute(next, "insert c", &[], 10).await.unwrap();
    router.commit(next).await.unwrap();
}

#[tokio::test]
async fn test_cancel_reaches_running_statement_over_tcp() {
    let cluster = tcp_cluster(1).await;
    let router = Arc::new(router(&cluster));
    let id = router.open_session().await.unwrap();

    let running = {
        let router = router.clone();
        tokio::spawn(async move { router.execute(id, "sleep 60000", &[], 10).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(router.cancel(id).await.unwrap());

    let err = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ProxyError::Cancelled(_)), "{err:?}");
    // The session survives its cancelled statement
    assert!(router.execute(id, "select 1", &[], 10).await.is_ok());
}

#[tokio::test]
async fn test_all_nodes_down_reports_attempts() {
    let cluster = tcp_cluster(2).await;
    for node in &cluster.nodes {
        node.shutdown().await;
    }
    let router = router(&cluster);
    match router.open_session().await.unwrap_err() {
        ProxyError::NoHealthyNodes { nodes, attempts } => {
            assert_eq!(nodes, 2);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected {other:?}"),
    }
}

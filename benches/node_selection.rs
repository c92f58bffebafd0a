//! Benchmarks for per-request hot paths
//!
//! Measures:
//! - cluster health parsing and share computation (every request carries a report)
//! - operation signature normalization (every statement is classified)
//! - node selection through the multinode router
//!
//! Run with: cargo bench --bench node_selection

use divan::{Bencher, black_box};
use ojp_proxy::capacity::{CapacityShare, CapacityTotals, ClusterHealth};
use ojp_proxy::config::{ClientConfig, create_default_config};
use ojp_proxy::segregation::OperationSignature;
use ojp_proxy::{InProcessTransport, MultinodeRouter, ProxyNode};
use std::sync::Arc;

fn main() {
    divan::main();
}

fn report(nodes: usize) -> String {
    (0..nodes)
        .map(|i| {
            let status = if i % 4 == 3 { "DOWN" } else { "UP" };
            format!("node-{i}.db.internal:1059({status})")
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[divan::bench_group(sample_count = 1000, sample_size = 100)]
mod capacity {
    use super::*;

    #[divan::bench(args = [2, 3, 8, 32])]
    fn parse_report(bencher: Bencher, nodes: usize) {
        let raw = report(nodes);
        bencher.bench_local(|| black_box(ClusterHealth::parse(black_box(&raw))));
    }

    #[divan::bench(args = [2, 3, 8, 32])]
    fn compute_share(bencher: Bencher, nodes: usize) {
        let health = ClusterHealth::parse(&report(nodes));
        let totals = CapacityTotals {
            max_size: 100,
            min_idle: 20,
            xa_max_size: 40,
            xa_min_idle: 8,
        };
        bencher.bench_local(|| {
            black_box(CapacityShare::compute(
                &totals,
                black_box(&health),
                "node-1.db.internal:1059",
            ))
        });
    }
}

#[divan::bench_group(sample_count = 1000, sample_size = 100)]
mod signature {
    use super::*;

    #[divan::bench]
    fn short_select(bencher: Bencher) {
        bencher.bench_local(|| black_box(OperationSignature::of(black_box("select * from t where id = 42"))));
    }

    #[divan::bench]
    fn long_insert(bencher: Bencher) {
        let values: Vec<String> = (0..50).map(|i| format!("({i}, 'name-{i}', {i}.5)")).collect();
        let sql = format!("insert into items (id, name, price) values {}", values.join(", "));
        bencher.bench_local(|| black_box(OperationSignature::of(black_box(&sql))));
    }
}

#[divan::bench_group(sample_count = 200, sample_size = 10)]
mod router {
    use super::*;

    fn cluster(nodes: usize) -> (MultinodeRouter, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport = Arc::new(InProcessTransport::new());
        let mut addresses = Vec::new();
        for i in 0..nodes {
            let address = format!("node-{i}:1059");
            let mut config = create_default_config();
            config.pool.provider = "direct".to_string();
            config.pool.min_idle = 0;
            config.xa.min_idle = 0;
            let node = runtime.block_on(async {
                ProxyNode::builder(config).address(address.clone()).build()
            });
            transport.bind(address.clone(), node);
            addresses.push(address);
        }
        let url = format!("jdbc:ojp[{}]_mem://bench", addresses.join(","));
        let router = MultinodeRouter::new(&url, ClientConfig::default(), transport).unwrap();
        (router, runtime)
    }

    #[divan::bench(args = [1, 3, 8])]
    fn open_close_session(bencher: Bencher, nodes: usize) {
        let (router, runtime) = cluster(nodes);
        bencher.bench_local(|| {
            runtime.block_on(async {
                let id = router.open_session().await.unwrap();
                router.close_session(black_box(id)).await;
            });
        });
    }

    #[divan::bench(args = [1, 3, 8])]
    fn execute_on_open_session(bencher: Bencher, nodes: usize) {
        let (router, runtime) = cluster(nodes);
        let id = runtime.block_on(router.open_session()).unwrap();
        bencher.bench_local(|| {
            runtime
                .block_on(router.execute(id, black_box("rows 1"), &[], 10))
                .unwrap()
        });
    }
}

//! Multi-node integration tests
//!
//! Drives the composite client against several live RPC nodes: fan-out,
//! single-random-peer admission, global top-K re-merge, and peer-set
//! maintenance.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use annex::knn::KnnArgs;
use annex::manager::{ManagerConfig, RequestManager};
use annex::ops::AddrSet;
use annex::rpc::{composite, AddDataItem, CompositeClient, RpcServer, RpcServerHandle};
use annex::store::VectorContainer;
use annex::vector::{DistanceKind, Vector};

struct TestCluster {
    handles: Vec<RpcServerHandle>,
    managers: Vec<Arc<RequestManager>>,
    addrs: Vec<String>,
}

impl TestCluster {
    async fn new(num_nodes: usize) -> Self {
        let mut handles = Vec::new();
        let mut managers = Vec::new();
        let mut addrs = Vec::new();

        for _ in 0..num_nodes {
            let manager = RequestManager::new(ManagerConfig::default());
            let handle = RpcServer::new(Arc::clone(&manager))
                .bind("127.0.0.1:0")
                .await
                .expect("bind rpc server");
            addrs.push(handle.local_addr().to_string());
            handles.push(handle);
            managers.push(manager);
        }

        Self {
            handles,
            managers,
            addrs,
        }
    }

    fn composite(&self) -> CompositeClient {
        CompositeClient::new(self.addrs.clone(), Some(Duration::from_secs(1)))
    }

    fn seed(&self, node: usize, namespace: &str, components: Vec<f64>) {
        let container = VectorContainer::new(
            Arc::new(Vector::new(components).unwrap()),
            Bytes::new(),
        );
        assert!(self.managers[node].add_data(namespace, container));
    }

    async fn shutdown(self) {
        for handle in self.handles {
            handle.stop().await;
        }
    }
}

fn knn_args(namespace: &str, k: usize) -> KnnArgs {
    KnnArgs {
        namespace: namespace.to_string(),
        priority: 1,
        query: Vector::new(vec![0.0, 0.0, 0.0]).unwrap(),
        distance: DistanceKind::Euclidean,
        ascending: true,
        k,
        extent: 1.0,
        accept: 0.0,
        reject: 1e9,
        ttl: Duration::from_millis(500),
        monitor: false,
    }
}

#[tokio::test]
async fn test_ping_fans_out_to_all_peers() {
    let cluster = TestCluster::new(3).await;
    let results = composite::collect(cluster.composite().ping()).await;

    assert_eq!(results.len(), 3);
    for peer in &results {
        assert!(matches!(peer.result, Ok(true)), "peer {} failed", peer.addr);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_add_data_goes_to_exactly_one_peer() {
    let cluster = TestCluster::new(3).await;

    let batch: Vec<AddDataItem> = (0..4)
        .map(|i| AddDataItem {
            namespace: "ns".to_string(),
            vec: Vector::new(vec![i as f64, 0.0, 0.0]).unwrap(),
            data: Bytes::new(),
            expires: None,
        })
        .collect();

    let result = cluster.composite().add_data(batch).await;
    assert_eq!(result.result.unwrap(), vec![true; 4]);

    let counts: Vec<usize> = cluster
        .managers
        .iter()
        .map(|m| m.len("ns").map(|(_, vecs)| vecs).unwrap_or(0))
        .collect();
    assert_eq!(counts.iter().sum::<usize>(), 4);
    // No replication: the whole batch landed on a single node.
    assert_eq!(counts.iter().filter(|&&c| c > 0).count(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_knn_merge_restores_global_order() {
    let cluster = TestCluster::new(3).await;
    cluster.seed(0, "ns", vec![1.0, 0.0, 0.0]);
    cluster.seed(0, "ns", vec![4.0, 0.0, 0.0]);
    cluster.seed(1, "ns", vec![2.0, 0.0, 0.0]);
    cluster.seed(2, "ns", vec![3.0, 0.0, 0.0]);
    cluster.seed(2, "ns", vec![5.0, 0.0, 0.0]);

    let merged = cluster
        .composite()
        .knn_eager_merge(knn_args("ns", 4))
        .await;

    let scores: Vec<f64> = merged.iter().map(|m| m.score).collect();
    assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0]);

    // Peer attribution follows where each vector actually lives.
    assert_eq!(merged[0].addr, cluster.addrs[0]);
    assert_eq!(merged[1].addr, cluster.addrs[1]);
    assert_eq!(merged[2].addr, cluster.addrs[2]);
    assert_eq!(merged[3].addr, cluster.addrs[0]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_dead_peer_does_not_fail_siblings() {
    let cluster = TestCluster::new(2).await;
    cluster.seed(0, "ns", vec![1.0, 0.0, 0.0]);
    cluster.seed(1, "ns", vec![2.0, 0.0, 0.0]);

    let mut addrs = cluster.addrs.clone();
    addrs.push("127.0.0.1:1".to_string()); // nobody home
    let composite_client = CompositeClient::new(addrs, Some(Duration::from_millis(500)));

    let results = composite::collect(composite_client.ping()).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results.iter().filter(|p| p.ok()).count(), 2);

    let merged = composite_client.knn_eager_merge(knn_args("ns", 2)).await;
    let scores: Vec<f64> = merged.iter().map(|m| m.score).collect();
    assert_eq!(scores, vec![1.0, 2.0]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_addr_set_maintenance_keeps_alive_peers() {
    let cluster = TestCluster::new(2).await;

    let set = AddrSet::new(Duration::ZERO, Duration::from_millis(500));
    let mut addrs = cluster.addrs.clone();
    addrs.push("127.0.0.1:1".to_string());
    set.add(addrs).await;

    let maintained = set.list_maintained().await;
    assert_eq!(maintained.len(), 2);
    assert!(maintained.iter().all(|a| cluster.addrs.contains(a)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_fanout_deadline_bounds_slow_cluster() {
    // One live node and one black hole; the fan-out closes by deadline
    // and reports the timeout on the dead entry only.
    let cluster = TestCluster::new(1).await;
    let addrs = vec![cluster.addrs[0].clone(), "127.0.0.1:1".to_string()];
    let composite_client = CompositeClient::new(addrs, Some(Duration::from_millis(300)));

    let started = std::time::Instant::now();
    let results = composite::collect(composite_client.ping()).await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|p| p.ok()).count(), 1);

    cluster.shutdown().await;
}

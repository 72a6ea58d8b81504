//! Composite client: fan-out/fan-in over a set of peer addresses
//!
//! Each method dispatches one concurrent call per address under a shared
//! deadline and emits per-peer results on a channel that closes once all
//! calls finish. The channel is sized to the peer count, so a caller that
//! walks away simply drops late results; workers never block on it.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::knn::{KnnArgs, Slot, TopK};
use crate::rpc::{
    AddDataItem, CapInfo, DimInfo, KnnEagerResult, LatencyInfo, LatencyQuery, LenInfo,
    MonitorInfo, MonitorQuery, PeerResult, RpcClient, DEFAULT_FANOUT_TIMEOUT,
};
use crate::vector::Vector;
use crate::Error;

/// Fan-out RPC helper over a fixed set of peer addresses.
#[derive(Debug, Clone)]
pub struct CompositeClient {
    addrs: Vec<String>,
    timeout: Duration,
}

/// One globally merged KNN result with peer attribution.
#[derive(Debug, Clone)]
pub struct MergedKnnItem {
    pub vec: Vector,
    pub score: f64,
    pub addr: String,
    pub net_latency: Duration,
}

impl CompositeClient {
    /// `timeout` falls back to [`DEFAULT_FANOUT_TIMEOUT`] when unset or
    /// non-positive.
    pub fn new(addrs: Vec<String>, timeout: Option<Duration>) -> Self {
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => DEFAULT_FANOUT_TIMEOUT,
        };
        Self { addrs, timeout }
    }

    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    pub fn ping(&self) -> mpsc::Receiver<PeerResult<bool>> {
        self.fan_out(|client| async move { client.ping(true).await })
    }

    /// Send the whole batch to one uniformly random peer. No replication:
    /// duplicating the batch across peers would skew any benchmark run on
    /// top of this engine.
    pub async fn add_data(&self, items: Vec<AddDataItem>) -> PeerResult<Vec<bool>> {
        if self.addrs.is_empty() {
            return PeerResult {
                addr: String::new(),
                latency: Duration::ZERO,
                result: Err(Error::network("no peer addresses")),
            };
        }
        let addr = &self.addrs[fastrand::usize(..self.addrs.len())];
        let client = RpcClient::new(addr.clone(), Some(self.timeout));
        match tokio::time::timeout(self.timeout, client.add_data(items)).await {
            Ok(result) => result,
            Err(_) => PeerResult {
                addr: addr.clone(),
                latency: self.timeout,
                result: Err(Error::DeadlineExceeded),
            },
        }
    }

    pub fn knn_eager(&self, args: KnnArgs) -> mpsc::Receiver<PeerResult<KnnEagerResult>> {
        self.fan_out(move |client| {
            let args = args.clone();
            async move { client.knn_eager(args).await }
        })
    }

    /// Fan out a KNN and re-merge the per-peer top-Ks into one globally
    /// ordered top-K, attributing each result to the peer it came from.
    /// Peers that error or answer not-ok are skipped.
    pub async fn knn_eager_merge(&self, args: KnnArgs) -> Vec<MergedKnnItem> {
        let k = args.k;
        let ascending = args.ascending;
        let mut rx = self.knn_eager(args);

        let mut topk: TopK<(Vector, String, Duration)> = TopK::new(k, ascending);
        while let Some(peer) = rx.recv().await {
            let (addr, latency) = (peer.addr, peer.latency);
            match peer.result {
                Ok(result) if result.ok => {
                    for item in result.knn {
                        topk.insert(Slot::new(
                            (item.vec, addr.clone(), latency),
                            item.score,
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("knn fan-out peer {} skipped: {}", addr, e);
                }
            }
        }

        topk.trimmed()
            .into_iter()
            .filter_map(|slot| {
                slot.payload.map(|(vec, addr, net_latency)| MergedKnnItem {
                    vec,
                    score: slot.score,
                    addr,
                    net_latency,
                })
            })
            .collect()
    }

    pub fn namespaces(&self) -> mpsc::Receiver<PeerResult<Vec<String>>> {
        self.fan_out(|client| async move { client.namespaces().await })
    }

    pub fn namespace(&self, namespace: String) -> mpsc::Receiver<PeerResult<bool>> {
        self.fan_out(move |client| {
            let namespace = namespace.clone();
            async move { client.namespace(namespace).await }
        })
    }

    pub fn dim(&self, namespace: String) -> mpsc::Receiver<PeerResult<DimInfo>> {
        self.fan_out(move |client| {
            let namespace = namespace.clone();
            async move { client.dim(namespace).await }
        })
    }

    pub fn len(&self, namespace: String) -> mpsc::Receiver<PeerResult<LenInfo>> {
        self.fan_out(move |client| {
            let namespace = namespace.clone();
            async move { client.len(namespace).await }
        })
    }

    pub fn cap(&self, namespace: String) -> mpsc::Receiver<PeerResult<CapInfo>> {
        self.fan_out(move |client| {
            let namespace = namespace.clone();
            async move { client.cap(namespace).await }
        })
    }

    pub fn knn_latency(&self, query: LatencyQuery) -> mpsc::Receiver<PeerResult<LatencyInfo>> {
        self.fan_out(move |client| {
            let query = query.clone();
            async move { client.knn_latency(query).await }
        })
    }

    pub fn knn_monitor(&self, query: MonitorQuery) -> mpsc::Receiver<PeerResult<MonitorInfo>> {
        self.fan_out(move |client| {
            async move { client.knn_monitor(query).await }
        })
    }

    /// Dispatch one call per address; the receiver closes when every call
    /// has completed or hit the shared deadline.
    fn fan_out<T, Fut>(
        &self,
        make: impl Fn(RpcClient) -> Fut,
    ) -> mpsc::Receiver<PeerResult<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = PeerResult<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(self.addrs.len().max(1));
        for addr in &self.addrs {
            let client = RpcClient::new(addr.clone(), Some(self.timeout));
            let call = make(client);
            let addr = addr.clone();
            let deadline = self.timeout;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => PeerResult {
                        addr,
                        latency: deadline,
                        result: Err(Error::DeadlineExceeded),
                    },
                };
                let _ = tx.send(result).await;
            });
        }
        rx
    }
}

/// Drain a fan-out receiver into a vector, arrival order.
pub async fn collect<T>(mut rx: mpsc::Receiver<PeerResult<T>>) -> Vec<PeerResult<T>> {
    let mut out = Vec::new();
    while let Some(result) = rx.recv().await {
        out.push(result);
    }
    out
}

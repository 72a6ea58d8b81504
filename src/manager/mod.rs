//! Request manager
//!
//! Owns the search-space set, the bounded admission queue, and the
//! telemetry rings. Every KNN request passes through here: validation,
//! queueing, TTL arming, pipeline execution, and telemetry recording.

mod telemetry;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::knn::{spawn_pipeline, KnnArgs, PipelineParams, ScoreItem};
use crate::store::{SearchSpaceSet, SetConfig, VectorContainer};

pub use telemetry::{KnnMonitorRing, KnnObservation, LatencyRing, MonitorStats, RingConfig};

/// Tunables for one node's request manager.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub set: SetConfig,
    pub maintenance_interval: Duration,
    pub maintenance_sleep_per_item: Duration,
    /// Admission queue capacity: requests waiting for an execution slot.
    pub knn_queue_buf: usize,
    /// Requests in execution at once.
    pub knn_queue_max_concurrent: usize,
    pub ring: RingConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            set: SetConfig {
                space_cap: 10_000,
                spaces_max_n: 100,
            },
            maintenance_interval: Duration::from_secs(10),
            maintenance_sleep_per_item: Duration::ZERO,
            knn_queue_buf: 128,
            knn_queue_max_concurrent: 8,
            ring: RingConfig::default(),
        }
    }
}

/// Handle to one enqueued KNN request.
pub struct KnnEnqueueResult {
    /// Yields the merged top-K, best first, then closes.
    pub pipe: mpsc::Receiver<ScoreItem>,
    /// Caller-side abort; also fired by TTL expiry and early accept.
    pub cancel: CancellationToken,
}

pub struct RequestManager {
    set: Arc<SearchSpaceSet>,
    config: ManagerConfig,
    admission: Arc<Semaphore>,
    queued: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    queue_latency: LatencyRing,
    query_latency: DashMap<String, Arc<LatencyRing>>,
    monitor: KnnMonitorRing,
    shutdown: CancellationToken,
}

impl RequestManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let set = Arc::new(SearchSpaceSet::new(config.set));
        let shutdown = CancellationToken::new();

        set.spawn_maintenance(
            config.maintenance_interval,
            config.maintenance_sleep_per_item,
            shutdown.child_token(),
        );

        Arc::new(Self {
            set,
            admission: Arc::new(Semaphore::new(config.knn_queue_max_concurrent.max(1))),
            queued: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            queue_latency: LatencyRing::new(config.ring),
            query_latency: DashMap::new(),
            monitor: KnnMonitorRing::new(config.ring),
            shutdown,
            config,
        })
    }

    /// Admit one container. Returns whether the vector was stored.
    pub fn add_data(&self, namespace: &str, container: VectorContainer) -> bool {
        match self.set.add(namespace, container) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("rejected admission into '{}': {}", namespace, e);
                false
            }
        }
    }

    /// Enqueue a KNN request.
    ///
    /// Returns `None` on invalid arguments, on a full admission queue, or
    /// during shutdown; the rejection is synchronous, never a silent wait.
    pub fn knn(self: &Arc<Self>, args: KnnArgs) -> Option<KnnEnqueueResult> {
        if !args.ok() || self.shutdown.is_cancelled() {
            return None;
        }

        // Bounded FIFO admission: the queue holds requests waiting for an
        // execution slot.
        if self.queued.fetch_add(1, Ordering::AcqRel) >= self.config.knn_queue_buf {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("knn request rejected, queue full");
            return None;
        }

        let cancel = self.shutdown.child_token();
        let (out_tx, out_rx) = mpsc::channel(args.k.max(1));

        let manager = Arc::clone(self);
        tokio::spawn(drive_request(manager, args, cancel.clone(), out_tx));

        Some(KnnEnqueueResult {
            pipe: out_rx,
            cancel,
        })
    }

    // Info surface. All answers are stale-tolerant snapshots.

    pub fn namespaces(&self) -> Vec<String> {
        self.set.namespaces()
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.set.has_namespace(namespace)
    }

    pub fn dim(&self, namespace: &str) -> Option<usize> {
        self.set.dim(namespace)
    }

    pub fn len(&self, namespace: &str) -> Option<(usize, usize)> {
        self.set.len(namespace)
    }

    pub fn cap(&self, namespace: &str) -> Option<usize> {
        self.set.cap(namespace)
    }

    /// `(queue avg, query avg, bounds_ok)` over `period`, or `None` for an
    /// unknown namespace.
    pub fn knn_latency(&self, namespace: &str, period: Duration) -> Option<(Duration, Duration, bool)> {
        if !self.set.has_namespace(namespace) {
            return None;
        }
        let (queue, queue_ok) = self.queue_latency.average(period);
        let (query, query_ok) = self
            .query_ring(namespace)
            .average(period);
        Some((queue, query, queue_ok && query_ok))
    }

    pub fn knn_monitor(&self, start: Duration, end: Duration) -> MonitorStats {
        self.monitor.query(start, end)
    }

    /// Cancel all in-flight requests and stop maintenance.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn query_ring(&self, namespace: &str) -> Arc<LatencyRing> {
        self.query_latency
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(LatencyRing::new(self.config.ring)))
            .clone()
    }

    /// Per-request base worker count: the concurrency budget split across
    /// requests currently in flight.
    fn base_workers(&self) -> usize {
        let in_flight = self.in_flight.load(Ordering::Relaxed).max(1);
        (self.config.knn_queue_max_concurrent / in_flight).max(1)
    }
}

async fn drive_request(
    manager: Arc<RequestManager>,
    args: KnnArgs,
    cancel: CancellationToken,
    out_tx: mpsc::Sender<ScoreItem>,
) {
    let queue_start = Instant::now();
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = manager.admission.clone().acquire_owned() => permit.ok(),
    };
    manager.queued.fetch_sub(1, Ordering::AcqRel);
    let Some(_permit) = permit else {
        // Cancelled while queued; dropping out_tx closes the pipe empty.
        return;
    };
    manager.queue_latency.record(queue_start.elapsed());

    manager.in_flight.fetch_add(1, Ordering::AcqRel);
    let query_start = Instant::now();

    // Arm the TTL now that execution starts.
    {
        let ttl = args.ttl;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(ttl) => cancel.cancel(),
            }
        });
    }

    let spaces = manager
        .set
        .scan_spaces(&args.namespace, args.extent)
        .unwrap_or_default();
    let workers = (args.priority * manager.base_workers())
        .min(spaces.len())
        .max(1);

    let mut pipe = spawn_pipeline(
        spaces,
        args.clone(),
        PipelineParams { workers },
        cancel.clone(),
    );

    let mut results = Vec::new();
    while let Some(item) = pipe.recv().await {
        results.push(item);
    }

    let latency = query_start.elapsed();
    manager.in_flight.fetch_sub(1, Ordering::AcqRel);
    manager.query_ring(&args.namespace).record(latency);

    if args.monitor {
        let failed = results.is_empty();
        manager.monitor.record(KnnObservation {
            latency,
            score: results.first().map(|r| r.score).unwrap_or(0.0),
            satisfaction: results.len() as f64 / args.k.max(1) as f64,
            failed,
        });
    }

    for item in results {
        if out_tx.send(item).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{DistanceKind, Vector};
    use bytes::Bytes;

    fn container(components: Vec<f64>) -> VectorContainer {
        VectorContainer::new(Arc::new(Vector::new(components).unwrap()), Bytes::new())
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
            ttl: Duration::from_secs(1),
            monitor: true,
        }
    }

    async fn drain(mut result: KnnEnqueueResult) -> Vec<ScoreItem> {
        let mut out = Vec::new();
        while let Some(item) = result.pipe.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_add_and_knn_round_trip() {
        let manager = RequestManager::new(ManagerConfig::default());
        for i in 1..=3 {
            let v = i as f64;
            assert!(manager.add_data("ns", container(vec![v, v, v])));
        }

        let result = manager.knn(knn_args("ns", 2)).expect("accepted");
        let items = drain(result).await;
        assert_eq!(items.len(), 2);
        assert!((items[0].score - 3.0_f64.sqrt()).abs() < 1e-9);
        assert!((items[1].score - 2.0 * 3.0_f64.sqrt()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_args_rejected_synchronously() {
        let manager = RequestManager::new(ManagerConfig::default());
        let mut args = knn_args("ns", 1);
        args.extent = 0.0;
        assert!(manager.knn(args).is_none());

        let mut args = knn_args("ns", 1);
        args.ttl = Duration::ZERO;
        assert!(manager.knn(args).is_none());
    }

    #[tokio::test]
    async fn test_unknown_namespace_yields_empty() {
        let manager = RequestManager::new(ManagerConfig::default());
        let result = manager.knn(knn_args("missing", 3)).expect("accepted");
        assert!(drain(result).await.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_fixed_per_namespace() {
        let manager = RequestManager::new(ManagerConfig::default());
        assert!(manager.add_data("a", container(vec![1.0, 1.0, 1.0])));
        assert!(!manager.add_data("a", container(vec![1.0, 1.0])));
        assert_eq!(manager.len("a"), Some((1, 1)));
        assert_eq!(manager.dim("a"), Some(3));
    }

    #[tokio::test]
    async fn test_info_surface() {
        let manager = RequestManager::new(ManagerConfig::default());
        assert!(manager.namespaces().is_empty());
        manager.add_data("a", container(vec![1.0, 2.0, 3.0]));

        assert_eq!(manager.namespaces(), vec!["a".to_string()]);
        assert!(manager.has_namespace("a"));
        assert!(!manager.has_namespace("b"));
        assert_eq!(manager.cap("a"), Some(10_000));
        assert!(manager.knn_latency("b", Duration::from_secs(1)).is_none());
        assert!(manager.knn_latency("a", Duration::from_secs(1)).is_some());
    }

    #[tokio::test]
    async fn test_queue_overload_rejects() {
        let config = ManagerConfig {
            knn_queue_buf: 0,
            knn_queue_max_concurrent: 1,
            ..Default::default()
        };
        let manager = RequestManager::new(config);
        manager.add_data("ns", container(vec![1.0, 1.0, 1.0]));

        // With a zero-length queue, the first request may claim the
        // execution slot, but a burst must observe rejections.
        let results: Vec<bool> = (0..64)
            .map(|_| manager.knn(knn_args("ns", 1)).is_some())
            .collect();
        assert!(results.iter().any(|ok| !ok));
    }

    #[tokio::test]
    async fn test_monitor_records_requests() {
        let manager = RequestManager::new(ManagerConfig::default());
        manager.add_data("ns", container(vec![1.0, 1.0, 1.0]));

        let result = manager.knn(knn_args("ns", 2)).expect("accepted");
        let items = drain(result).await;
        assert_eq!(items.len(), 1);

        let stats = manager.knn_monitor(Duration::from_secs(10), Duration::ZERO);
        assert_eq!(stats.n, 1);
        assert_eq!(stats.n_failed, 0);
        // satisfaction = 1 result / k=2
        assert!((stats.avg_satisfaction - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let manager = RequestManager::new(ManagerConfig::default());
        manager.add_data("ns", container(vec![1.0, 1.0, 1.0]));
        manager.shutdown();
        assert!(manager.knn(knn_args("ns", 1)).is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry_yields_partial_not_error() {
        let manager = RequestManager::new(ManagerConfig::default());
        for i in 0..100 {
            manager.add_data("ns", container(vec![i as f64, 0.0, 0.0]));
        }
        let mut args = knn_args("ns", 5);
        args.ttl = Duration::from_millis(1);
        let result = manager.knn(args).expect("accepted");
        // Whatever the merger held when the TTL fired; closing cleanly is
        // the contract.
        let items = drain(result).await;
        assert!(items.len() <= 5);
    }
}

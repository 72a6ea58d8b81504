//! Staged KNN dataflow
//!
//! Four stages wired by bounded channels, one cancel token:
//!
//! ```text
//! scan (xN) -> score (xN) -> filter (x1) -> merge (x1) -> pipe
//! ```
//!
//! Scan workers drain whole spaces; score applies the distance function
//! and the reject threshold; filter sheds candidates already dominated by
//! the merger's worst slot; the single merger owns the top-K buffer and
//! fires cancel on early accept. Every stage checks the token on every
//! step, so TTL expiry, caller abort and early accept all tear the
//! pipeline down the same way. Whatever the merger holds when its input
//! closes is the result; partial output is not an error.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::knn::topk::{better, ScoreItem, Slot, TopK};
use crate::knn::KnnArgs;
use crate::store::SearchSpace;
use crate::vector::SharedVector;

const STAGE_BUF: usize = 64;

/// Sentinel for "merge buffer not yet full, nothing to shed against".
const NO_BOUND: u64 = u64::MAX;

/// Worker budget for the parallel stages, already weighted by request
/// priority and clamped to the number of spaces by the request manager.
#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub workers: usize,
}

/// Spawn the pipeline for one request over a pre-selected set of spaces.
///
/// The returned receiver yields the final merged top-K, best first, then
/// closes. The caller owns `cancel`; the merger also fires it on early
/// accept.
pub fn spawn_pipeline(
    spaces: Vec<Arc<SearchSpace>>,
    args: KnnArgs,
    params: PipelineParams,
    cancel: CancellationToken,
) -> mpsc::Receiver<ScoreItem> {
    let args = Arc::new(args);
    let workers = params.workers.clamp(1, spaces.len().max(1));

    let (scan_tx, scan_rx) = mpsc::channel::<SharedVector>(STAGE_BUF);
    let (score_tx, score_rx) = mpsc::channel::<ScoreItem>(STAGE_BUF);
    let (filter_tx, filter_rx) = mpsc::channel::<ScoreItem>(STAGE_BUF);
    let (out_tx, out_rx) = mpsc::channel::<ScoreItem>(args.k.max(1));

    // Worst-score bound published by the merger once its buffer is full,
    // read by the filter stage.
    let bound = Arc::new(AtomicU64::new(NO_BOUND));

    spawn_scan_stage(spaces, workers, scan_tx, cancel.clone());
    spawn_score_stage(scan_rx, score_tx, Arc::clone(&args), workers, cancel.clone());
    spawn_filter_stage(score_rx, filter_tx, Arc::clone(&args), Arc::clone(&bound), cancel.clone());
    spawn_merge_stage(filter_rx, out_tx, args, bound, cancel);

    out_rx
}

fn spawn_scan_stage(
    spaces: Vec<Arc<SearchSpace>>,
    workers: usize,
    scan_tx: mpsc::Sender<SharedVector>,
    cancel: CancellationToken,
) {
    let spaces = Arc::new(spaces);
    let next = Arc::new(AtomicUsize::new(0));

    for _ in 0..workers {
        let spaces = Arc::clone(&spaces);
        let next = Arc::clone(&next);
        let tx = scan_tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let idx = next.fetch_add(1, Ordering::Relaxed);
                let Some(space) = spaces.get(idx) else { break };
                if cancel.is_cancelled() {
                    break;
                }

                // The per-space extent was already applied when spaces were
                // selected; each chosen space is drained fully.
                space
                    .scan(1.0, &cancel, |vector| {
                        let tx = tx.clone();
                        let cancel = cancel.clone();
                        async move {
                            tokio::select! {
                                _ = cancel.cancelled() => false,
                                sent = tx.send(vector) => sent.is_ok(),
                            }
                        }
                    })
                    .await;
            }
        });
    }
}

fn spawn_score_stage(
    scan_rx: mpsc::Receiver<SharedVector>,
    score_tx: mpsc::Sender<ScoreItem>,
    args: Arc<KnnArgs>,
    workers: usize,
    cancel: CancellationToken,
) {
    let rx = Arc::new(Mutex::new(scan_rx));

    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        let tx = score_tx.clone();
        let args = Arc::clone(&args);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                let vector = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        v = rx.recv() => v,
                    }
                };
                let Some(vector) = vector else { break };

                // A query/namespace dimension mismatch surfaces as a scan
                // that scores nothing; the request completes empty.
                let score = match args.distance.score(&args.query, &vector) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if score.is_nan() {
                    continue;
                }
                // Candidates worse than the reject threshold are dropped at
                // the source.
                if better(args.ascending, args.reject, score) {
                    continue;
                }

                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = tx.send(Slot::new(vector, score)) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
            }
        });
    }
}

fn spawn_filter_stage(
    mut score_rx: mpsc::Receiver<ScoreItem>,
    filter_tx: mpsc::Sender<ScoreItem>,
    args: Arc<KnnArgs>,
    bound: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => None,
                item = score_rx.recv() => item,
            };
            let Some(item) = item else { break };

            // Shed work the merger would throw away anyway: once the top-K
            // is full, only strictly-better-than-worst candidates can land.
            let bits = bound.load(Ordering::Relaxed);
            if bits != NO_BOUND {
                let worst = f64::from_bits(bits);
                if !better(args.ascending, item.score, worst) {
                    continue;
                }
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => false,
                sent = filter_tx.send(item) => sent.is_ok(),
            };
            if !sent {
                break;
            }
        }
    });
}

fn spawn_merge_stage(
    mut filter_rx: mpsc::Receiver<ScoreItem>,
    out_tx: mpsc::Sender<ScoreItem>,
    args: Arc<KnnArgs>,
    bound: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut topk: TopK<SharedVector> = TopK::new(args.k, args.ascending);

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => None,
                item = filter_rx.recv() => item,
            };
            let Some(item) = item else { break };

            topk.insert(item);
            if let Some(worst) = topk.worst() {
                bound.store(worst.to_bits(), Ordering::Relaxed);
            }
            if topk.all_better_than(args.accept) {
                // Early accept: K results good enough, stop the upstream.
                cancel.cancel();
                break;
            }
        }

        for item in topk.trimmed() {
            if out_tx.send(item).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{DistanceKind, Vector};
    use bytes::Bytes;
    use std::time::Duration;

    use crate::store::VectorContainer;

    fn space_with(vectors: &[Vec<f64>]) -> Arc<SearchSpace> {
        let dim = vectors[0].len();
        let space = SearchSpace::new(dim, vectors.len().max(1));
        for v in vectors {
            space
                .add(VectorContainer::new(
                    Arc::new(Vector::new(v.clone()).unwrap()),
                    Bytes::new(),
                ))
                .unwrap();
        }
        Arc::new(space)
    }

    fn args(k: usize) -> KnnArgs {
        KnnArgs {
            namespace: "ns".to_string(),
            priority: 1,
            query: Vector::new(vec![0.0, 0.0, 0.0]).unwrap(),
            distance: DistanceKind::Euclidean,
            ascending: true,
            k,
            extent: 1.0,
            accept: 0.0,
            reject: 1e9,
            ttl: Duration::from_secs(1),
            monitor: false,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<ScoreItem>) -> Vec<ScoreItem> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_euclidean_top_2_in_order() {
        let spaces = vec![space_with(&[
            vec![2.0, 2.0, 2.0],
            vec![1.0, 1.0, 1.0],
            vec![3.0, 3.0, 3.0],
        ])];
        let rx = spawn_pipeline(
            spaces,
            args(2),
            PipelineParams { workers: 1 },
            CancellationToken::new(),
        );
        let results = drain(rx).await;

        assert_eq!(results.len(), 2);
        assert!((results[0].score - 3.0_f64.sqrt()).abs() < 1e-9);
        assert!((results[1].score - 2.0 * 3.0_f64.sqrt()).abs() < 1e-9);
        assert_eq!(
            results[0].payload.as_ref().unwrap().as_slice(),
            &[1.0, 1.0, 1.0]
        );
    }

    #[tokio::test]
    async fn test_k_larger_than_available() {
        let spaces = vec![space_with(&[vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0]])];
        let rx = spawn_pipeline(
            spaces,
            args(10),
            PipelineParams { workers: 2 },
            CancellationToken::new(),
        );
        assert_eq!(drain(rx).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reject_prunes_candidates() {
        let spaces = vec![space_with(&[
            vec![1.0, 1.0, 1.0],
            vec![100.0, 100.0, 100.0],
        ])];
        let mut a = args(10);
        a.reject = 5.0;
        let rx = spawn_pipeline(
            spaces,
            a,
            PipelineParams { workers: 1 },
            CancellationToken::new(),
        );
        let results = drain(rx).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].score < 5.0);
    }

    #[tokio::test]
    async fn test_multi_space_fan_out_merges_ordered() {
        let spaces = vec![
            space_with(&[vec![4.0, 0.0, 0.0], vec![1.0, 0.0, 0.0]]),
            space_with(&[vec![3.0, 0.0, 0.0]]),
            space_with(&[vec![2.0, 0.0, 0.0], vec![5.0, 0.0, 0.0]]),
        ];
        let rx = spawn_pipeline(
            spaces,
            args(4),
            PipelineParams { workers: 3 },
            CancellationToken::new(),
        );
        let results = drain(rx).await;
        let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_early_accept_cancels_upstream() {
        // Plenty of identical perfect matches: the merger should accept
        // early and cancel instead of scanning everything.
        let vectors: Vec<Vec<f64>> = (0..1000).map(|_| vec![0.0, 0.0, 0.0]).collect();
        let spaces = vec![space_with(&vectors)];
        let mut a = args(5);
        a.accept = 0.5;
        let cancel = CancellationToken::new();
        let rx = spawn_pipeline(spaces, a, PipelineParams { workers: 1 }, cancel.clone());
        let results = drain(rx).await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.score < 0.5));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_yields_partial() {
        let spaces = vec![space_with(&[vec![1.0, 1.0, 1.0]])];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rx = spawn_pipeline(spaces, args(3), PipelineParams { workers: 1 }, cancel);
        // Pre-cancelled: the pipe still closes cleanly, possibly empty.
        let results = drain(rx).await;
        assert!(results.len() <= 1);
    }

    #[tokio::test]
    async fn test_descending_cosine_order() {
        let spaces = vec![space_with(&[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.2, 0.0],
        ])];
        let mut a = args(3);
        a.query = Vector::new(vec![1.0, 0.0, 0.0]).unwrap();
        a.distance = DistanceKind::Cosine;
        a.ascending = false;
        a.accept = 2.0; // unreachable: cosine tops out at 1
        a.reject = -1.0;
        let rx = spawn_pipeline(
            spaces,
            a,
            PipelineParams { workers: 1 },
            CancellationToken::new(),
        );
        let results = drain(rx).await;
        let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
        assert_eq!(scores.len(), 3);
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert!((scores[0] - 1.0).abs() < 1e-9);
    }
}

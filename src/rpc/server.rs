//! RPC server: TCP accept loop and per-method dispatch

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::RequestManager;
use crate::rpc::{
    read_frame, write_frame, CapInfo, DimInfo, KnnEagerResult, KnnResultItem, LatencyInfo,
    LenInfo, MonitorInfo, Request, Response, RpcResp,
};
use crate::store::VectorContainer;
use crate::{knn::KnnArgs, Result};

/// Slack granted to the pipeline past the request TTL before the handler
/// force-cancels and returns whatever merged so far.
const TTL_EPSILON: Duration = Duration::from_millis(25);

/// RPC endpoint over one request manager.
pub struct RpcServer {
    manager: Arc<RequestManager>,
}

/// Running server: address, cancel source, accept-loop task.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to wind down. In-flight
    /// handlers finish their single request on their own.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

impl RpcServer {
    pub fn new(manager: Arc<RequestManager>) -> Self {
        Self { manager }
    }

    /// Bind and start serving. Bind failure is the only fatal error.
    pub async fn bind(self, addr: &str) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let manager = self.manager;
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(manager, stream).await {
                                tracing::debug!("rpc connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("rpc accept failed: {}", e);
                    }
                }
            }
            tracing::info!("rpc accept loop stopped on {}", local_addr);
        });

        tracing::info!("rpc server listening on {}", local_addr);
        Ok(RpcServerHandle {
            local_addr,
            cancel,
            task,
        })
    }
}

/// One connection, one request, one response.
async fn handle_connection(manager: Arc<RequestManager>, mut stream: TcpStream) -> Result<()> {
    let request: Request = read_frame(&mut stream).await?;
    let recv_time = Utc::now();

    let response = match request {
        Request::Ping(_) => Response::Ping(RpcResp {
            recv_time,
            payload: true,
        }),
        Request::AddData(envelope) => {
            let mut admitted = Vec::with_capacity(envelope.payload.len());
            for item in envelope.payload {
                let mut container =
                    VectorContainer::new(Arc::new(item.vec), item.data);
                if let Some(expires) = item.expires {
                    container = container.with_expiration(expires);
                }
                admitted.push(manager.add_data(&item.namespace, container));
            }
            Response::AddData(RpcResp {
                recv_time,
                payload: admitted,
            })
        }
        Request::KnnEager(envelope) => {
            let net_delay = (recv_time - envelope.send_time)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let payload = knn_eager(&manager, envelope.payload, net_delay).await;
            Response::KnnEager(RpcResp { recv_time, payload })
        }
        Request::Namespaces(_) => Response::Namespaces(RpcResp {
            recv_time,
            payload: manager.namespaces(),
        }),
        Request::Namespace(envelope) => Response::Namespace(RpcResp {
            recv_time,
            payload: manager.has_namespace(&envelope.payload),
        }),
        Request::Dim(envelope) => {
            let dim = manager.dim(&envelope.payload);
            Response::Dim(RpcResp {
                recv_time,
                payload: DimInfo {
                    lookup_ok: dim.is_some(),
                    dim: dim.unwrap_or(0),
                },
            })
        }
        Request::Len(envelope) => {
            let len = manager.len(&envelope.payload);
            let (n_sspaces, n_vecs) = len.unwrap_or((0, 0));
            Response::Len(RpcResp {
                recv_time,
                payload: LenInfo {
                    lookup_ok: len.is_some(),
                    n_sspaces,
                    n_vecs,
                },
            })
        }
        Request::Cap(envelope) => {
            let cap = manager.cap(&envelope.payload);
            Response::Cap(RpcResp {
                recv_time,
                payload: CapInfo {
                    lookup_ok: cap.is_some(),
                    cap: cap.unwrap_or(0),
                },
            })
        }
        Request::KnnLatency(envelope) => {
            let query = envelope.payload;
            let looked_up = manager.knn_latency(&query.key, query.period);
            let payload = match looked_up {
                Some((queue, latency, bounds_ok)) => LatencyInfo {
                    lookup_ok: true,
                    queue,
                    query: latency,
                    bounds_ok,
                },
                None => LatencyInfo {
                    lookup_ok: false,
                    queue: Duration::ZERO,
                    query: Duration::ZERO,
                    bounds_ok: false,
                },
            };
            Response::KnnLatency(RpcResp { recv_time, payload })
        }
        Request::KnnMonitor(envelope) => {
            let query = envelope.payload;
            let stats = manager.knn_monitor(query.start, query.end);
            Response::KnnMonitor(RpcResp {
                recv_time,
                payload: MonitorInfo::from(stats),
            })
        }
    };

    write_frame(&mut stream, &response).await
}

/// Run one synchronous KNN bounded by the TTL that remains after network
/// send time is deducted.
async fn knn_eager(
    manager: &Arc<RequestManager>,
    mut args: KnnArgs,
    net_delay: Duration,
) -> KnnEagerResult {
    let not_ok = KnnEagerResult {
        knn: Vec::new(),
        ok: false,
    };

    let Some(remaining) = args.ttl.checked_sub(net_delay) else {
        return not_ok;
    };
    if remaining.is_zero() {
        return not_ok;
    }
    args.ttl = remaining;

    let Some(mut enqueued) = manager.knn(args) else {
        return not_ok;
    };

    let deadline = tokio::time::Instant::now() + remaining + TTL_EPSILON;
    let mut items = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, enqueued.pipe.recv()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => break,
            Err(_) => {
                // Handler timer fired; drop the rest of the pipe.
                enqueued.cancel.cancel();
                break;
            }
        }
    }

    KnnEagerResult {
        knn: items
            .into_iter()
            .filter_map(|item| {
                item.payload.map(|vector| KnnResultItem {
                    vec: (*vector).clone(),
                    score: item.score,
                })
            })
            .collect(),
        ok: true,
    }
}

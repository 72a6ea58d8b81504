//! HTTP facade handlers
//!
//! Thin JSON wrappers over the core: operator endpoints manage the peer
//! address set and the RPC server lifecycle, command endpoints fan out
//! over the maintained peers, info endpoints mirror the manager's info
//! surface per peer. Durations cross this boundary as integer
//! nanoseconds.

use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::state::SharedState;
use crate::knn::KnnArgs;
use crate::manager::{ManagerConfig, RingConfig};
use crate::ops::{LifecycleState, StartConfig};
use crate::rpc::{composite, AddDataItem, LatencyQuery, MonitorQuery, PeerResult};
use crate::store::SetConfig;
use crate::vector::{DistanceKind, Vector};
use crate::Error;

type HandlerError = (StatusCode, String);

fn bad_request(msg: impl Into<String>) -> HandlerError {
    (StatusCode::BAD_REQUEST, msg.into())
}

/// Liveness echo.
pub async fn ping(Json(payload): Json<bool>) -> Json<bool> {
    Json(payload)
}

// Operator surface ---------------------------------------------------------

/// Union addresses into the peer set; responds with the resulting set.
pub async fn addrs_put(
    State(state): State<SharedState>,
    Json(addrs): Json<Vec<String>>,
) -> Json<Vec<String>> {
    Json(state.addrs.add(addrs).await)
}

/// The maintained peer set (runs a ping pass when one is due).
pub async fn addrs_get(State(state): State<SharedState>) -> Json<Vec<String>> {
    Json(state.addrs.list_maintained().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartRequest {
    #[serde(rename = "RPCAddr")]
    pub rpc_addr: String,
    pub search_spaces_max_cap: Option<usize>,
    pub search_spaces_max_n: Option<usize>,
    pub maintenance_interval_ns: Option<u64>,
    pub maintenance_sleep_per_item_ns: Option<u64>,
    #[serde(rename = "KNNQueueBuf")]
    pub knn_queue_buf: Option<usize>,
    #[serde(rename = "KNNQueueMaxConcurrent")]
    pub knn_queue_max_concurrent: Option<usize>,
    pub latency_chain_link_n: Option<usize>,
    pub latency_chain_link_size_ns: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleCode {
    pub code: LifecycleState,
}

impl StartRequest {
    fn to_config(&self) -> Result<StartConfig, HandlerError> {
        if self.rpc_addr.trim().is_empty() {
            return Err(bad_request("RPCAddr must be specified"));
        }
        let defaults = ManagerConfig::default();
        let set = SetConfig {
            space_cap: self
                .search_spaces_max_cap
                .unwrap_or(defaults.set.space_cap),
            spaces_max_n: self
                .search_spaces_max_n
                .unwrap_or(defaults.set.spaces_max_n),
        };
        if set.space_cap == 0 || set.spaces_max_n == 0 {
            return Err(bad_request("search space caps must be positive"));
        }

        let ring = RingConfig {
            max_chain_link_n: self
                .latency_chain_link_n
                .unwrap_or(defaults.ring.max_chain_link_n),
            min_chain_link_size: self
                .latency_chain_link_size_ns
                .map(Duration::from_nanos)
                .unwrap_or(defaults.ring.min_chain_link_size),
        };
        if ring.max_chain_link_n == 0 || ring.min_chain_link_size.is_zero() {
            return Err(bad_request("latency chain geometry must be positive"));
        }

        let knn_queue_max_concurrent = self
            .knn_queue_max_concurrent
            .unwrap_or(defaults.knn_queue_max_concurrent);
        if knn_queue_max_concurrent == 0 {
            return Err(bad_request("KNNQueueMaxConcurrent must be positive"));
        }

        Ok(StartConfig {
            rpc_addr: self.rpc_addr.clone(),
            manager: ManagerConfig {
                set,
                maintenance_interval: self
                    .maintenance_interval_ns
                    .map(Duration::from_nanos)
                    .unwrap_or(defaults.maintenance_interval),
                maintenance_sleep_per_item: self
                    .maintenance_sleep_per_item_ns
                    .map(Duration::from_nanos)
                    .unwrap_or(defaults.maintenance_sleep_per_item),
                knn_queue_buf: self.knn_queue_buf.unwrap_or(defaults.knn_queue_buf),
                knn_queue_max_concurrent,
                ring,
            },
        })
    }
}

/// Start the embedded RPC server; registers the bound address into the
/// peer set only once the start succeeded, so a conflict leaves the set
/// untouched.
pub async fn server_start(
    State(state): State<SharedState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<LifecycleCode>), HandlerError> {
    let config = request.to_config()?;

    match state.lifecycle.start(config).await {
        Ok(code) => {
            if let Some(addr) = state.lifecycle.local_addr().await {
                state.addrs.add(vec![addr.to_string()]).await;
            }
            Ok((StatusCode::OK, Json(LifecycleCode { code })))
        }
        Err(Error::Conflict(current)) => {
            Ok((StatusCode::CONFLICT, Json(LifecycleCode { code: current })))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

pub async fn server_stop(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<LifecycleCode>), HandlerError> {
    match state.lifecycle.stop().await {
        Ok(code) => Ok((StatusCode::OK, Json(LifecycleCode { code }))),
        Err(Error::Conflict(current)) => {
            Ok((StatusCode::CONFLICT, Json(LifecycleCode { code: current })))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

// Command surface ----------------------------------------------------------

/// Per-peer scalar answer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerValue<T> {
    pub addr: String,
    /// Round-trip latency in nanoseconds as seen by this node.
    pub latency: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_err: Option<String>,
    pub payload: Option<T>,
}

/// Per-peer structured answer with the payload fields inlined.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo<T> {
    pub addr: String,
    pub latency: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_err: Option<String>,
    #[serde(flatten)]
    pub payload: Option<T>,
}

fn peer_value<T>(result: PeerResult<T>) -> PeerValue<T> {
    let (payload, net_err) = split(result.result);
    PeerValue {
        addr: result.addr,
        latency: result.latency.as_nanos() as u64,
        net_err,
        payload,
    }
}

fn peer_info<T>(result: PeerResult<T>) -> PeerInfo<T> {
    let (payload, net_err) = split(result.result);
    PeerInfo {
        addr: result.addr,
        latency: result.latency.as_nanos() as u64,
        net_err,
        payload,
    }
}

fn split<T>(result: crate::Result<T>) -> (Option<T>, Option<String>) {
    match result {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

/// Ping every maintained peer over RPC.
pub async fn cmd_ping(State(state): State<SharedState>) -> Json<Vec<PeerValue<bool>>> {
    let rx = state.composite().await.ping();
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_value).collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddItem {
    pub namespace: String,
    pub vec: Vec<f64>,
    /// Opaque payload stored with the vector.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

/// Admit a batch of vectors on one randomly chosen peer. The response is
/// one bool per input, in order.
pub async fn cmd_add(
    State(state): State<SharedState>,
    Json(items): Json<Vec<AddItem>>,
) -> Result<Json<Vec<bool>>, HandlerError> {
    let mut batch = Vec::with_capacity(items.len());
    for item in items {
        let vec = Vector::new(item.vec).map_err(|e| bad_request(e.to_string()))?;
        batch.push(AddDataItem {
            namespace: item.namespace,
            vec,
            data: item
                .data
                .map(|s| bytes::Bytes::from(s.into_bytes()))
                .unwrap_or_default(),
            expires: item.expires,
        });
    }

    let result = state.composite().await.add_data(batch).await;
    match result.result {
        Ok(admitted) => Ok(Json(admitted)),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnnRequest {
    pub namespace: String,
    #[serde(default = "default_priority")]
    pub priority: usize,
    pub query_vecs: Vec<Vec<f64>>,
    #[serde(rename = "KNNMethod")]
    pub knn_method: u8,
    pub ascending: bool,
    pub k: usize,
    pub extent: f64,
    pub accept: f64,
    pub reject: f64,
    /// Request TTL in nanoseconds.
    #[serde(rename = "TTL")]
    pub ttl: u64,
    #[serde(default)]
    pub monitor: bool,
}

fn default_priority() -> usize {
    1
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnnItem {
    pub vec: Vec<f64>,
    pub score: f64,
    pub addr: String,
    /// Peer round-trip in nanoseconds.
    pub net_latency: u64,
}

/// Fan a KNN out across the cluster, one globally merged top-K per query
/// vector.
pub async fn cmd_knn(
    State(state): State<SharedState>,
    Json(request): Json<KnnRequest>,
) -> Result<Json<Vec<Vec<KnnItem>>>, HandlerError> {
    let distance =
        DistanceKind::try_from(request.knn_method).map_err(|e| bad_request(e.to_string()))?;
    let composite = state.composite().await;

    let mut all = Vec::with_capacity(request.query_vecs.len());
    for components in &request.query_vecs {
        let query = Vector::new(components.clone()).map_err(|e| bad_request(e.to_string()))?;
        let args = KnnArgs {
            namespace: request.namespace.clone(),
            priority: request.priority,
            query,
            distance,
            ascending: request.ascending,
            k: request.k,
            extent: request.extent,
            accept: request.accept,
            reject: request.reject,
            ttl: Duration::from_nanos(request.ttl),
            monitor: request.monitor,
        };

        let merged = composite.knn_eager_merge(args).await;
        all.push(
            merged
                .into_iter()
                .map(|item| KnnItem {
                    vec: item.vec.into(),
                    score: item.score,
                    addr: item.addr,
                    net_latency: item.net_latency.as_nanos() as u64,
                })
                .collect(),
        );
    }

    Ok(Json(all))
}

// Info surface -------------------------------------------------------------

pub async fn info_namespaces(
    State(state): State<SharedState>,
) -> Json<Vec<PeerValue<Vec<String>>>> {
    let rx = state.composite().await.namespaces();
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_value).collect())
}

pub async fn info_namespace(
    State(state): State<SharedState>,
    Json(namespace): Json<String>,
) -> Json<Vec<PeerValue<bool>>> {
    let rx = state.composite().await.namespace(namespace);
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_value).collect())
}

pub async fn info_dim(
    State(state): State<SharedState>,
    Json(namespace): Json<String>,
) -> Json<Vec<PeerInfo<crate::rpc::DimInfo>>> {
    let rx = state.composite().await.dim(namespace);
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_info).collect())
}

pub async fn info_len(
    State(state): State<SharedState>,
    Json(namespace): Json<String>,
) -> Json<Vec<PeerInfo<crate::rpc::LenInfo>>> {
    let rx = state.composite().await.len(namespace);
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_info).collect())
}

pub async fn info_cap(
    State(state): State<SharedState>,
    Json(namespace): Json<String>,
) -> Json<Vec<PeerInfo<crate::rpc::CapInfo>>> {
    let rx = state.composite().await.cap(namespace);
    let results = composite::collect(rx).await;
    Json(results.into_iter().map(peer_info).collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyRequest {
    pub key: String,
    /// Window in nanoseconds back from now.
    pub period: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyPayload {
    pub lookup_ok: bool,
    pub queue: u64,
    pub query: u64,
    pub bounds_ok: bool,
}

pub async fn info_knn_latency(
    State(state): State<SharedState>,
    Json(request): Json<LatencyRequest>,
) -> Json<Vec<PeerInfo<LatencyPayload>>> {
    let query = LatencyQuery {
        key: request.key,
        period: Duration::from_nanos(request.period),
    };
    let rx = state.composite().await.knn_latency(query);
    let results = composite::collect(rx).await;
    Json(
        results
            .into_iter()
            .map(|peer| {
                let (payload, net_err) = split(peer.result);
                PeerInfo {
                    addr: peer.addr,
                    latency: peer.latency.as_nanos() as u64,
                    net_err,
                    payload: payload.map(|p| LatencyPayload {
                        lookup_ok: p.lookup_ok,
                        queue: p.queue.as_nanos() as u64,
                        query: p.query.as_nanos() as u64,
                        bounds_ok: p.bounds_ok,
                    }),
                }
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorRequest {
    /// Window start, nanoseconds back from now.
    pub start: u64,
    /// Window end, nanoseconds back from now.
    #[serde(default)]
    pub end: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorPayload {
    pub created: DateTime<Utc>,
    pub span: u64,
    pub n: u64,
    pub n_failed: u64,
    pub avg_latency: u64,
    pub avg_score: f64,
    pub avg_score_no_fails: f64,
    pub avg_satisfaction: f64,
}

pub async fn info_knn_monitor(
    State(state): State<SharedState>,
    Json(request): Json<MonitorRequest>,
) -> Json<Vec<PeerInfo<MonitorPayload>>> {
    let query = MonitorQuery {
        start: Duration::from_nanos(request.start),
        end: Duration::from_nanos(request.end),
    };
    let rx = state.composite().await.knn_monitor(query);
    let results = composite::collect(rx).await;
    Json(
        results
            .into_iter()
            .map(|peer| {
                let (payload, net_err) = split(peer.result);
                PeerInfo {
                    addr: peer.addr,
                    latency: peer.latency.as_nanos() as u64,
                    net_err,
                    payload: payload.map(|p| MonitorPayload {
                        created: p.created,
                        span: p.span.as_nanos() as u64,
                        n: p.n,
                        n_failed: p.n_failed,
                        avg_latency: p.avg_latency.as_nanos() as u64,
                        avg_score: p.avg_score,
                        avg_score_no_fails: p.avg_score_no_fails,
                        avg_satisfaction: p.avg_satisfaction,
                    }),
                }
            })
            .collect(),
    )
}

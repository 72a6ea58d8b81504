//! Peer RPC: envelope, wire framing, server, client, and fan-out
//!
//! Every method call is one TCP connection: the client writes a framed
//! request and reads a framed response. Frames are 4-byte big-endian
//! length prefixes followed by a MessagePack body. The envelope carries a
//! send timestamp out and a receive timestamp back, so both sides can
//! account for network time; the server deducts it from KNN TTLs.

pub mod client;
pub mod composite;
pub mod server;

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::knn::KnnArgs;
use crate::manager::MonitorStats;
use crate::vector::Vector;
use crate::{Error, Result};

pub use client::{PeerResult, RpcClient};
pub use composite::{CompositeClient, MergedKnnItem};
pub use server::{RpcServer, RpcServerHandle};

/// Dial timeout applied when the caller leaves it unset or non-positive.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Fan-out deadline applied when the caller leaves it unset or non-positive.
pub const DEFAULT_FANOUT_TIMEOUT: Duration = Duration::from_secs(3);

/// Refusing frames beyond this bound keeps a bad peer from ballooning the
/// handler's read buffer.
const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Outbound half of the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcArgs<T> {
    pub send_time: DateTime<Utc>,
    pub payload: T,
}

impl<T> RpcArgs<T> {
    /// Stamp `payload` with the current instant.
    pub fn now(payload: T) -> Self {
        Self {
            send_time: Utc::now(),
            payload,
        }
    }
}

/// Inbound half of the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcResp<T> {
    pub recv_time: DateTime<Utc>,
    pub payload: T,
}

/// One vector to admit, with its namespace and optional expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddDataItem {
    pub namespace: String,
    pub vec: Vector,
    pub data: Bytes,
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnnResultItem {
    pub vec: Vector,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnnEagerResult {
    #[serde(rename = "KNN")]
    pub knn: Vec<KnnResultItem>,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DimInfo {
    pub lookup_ok: bool,
    pub dim: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LenInfo {
    pub lookup_ok: bool,
    #[serde(rename = "NSSpaces")]
    pub n_sspaces: usize,
    pub n_vecs: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapInfo {
    pub lookup_ok: bool,
    pub cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyQuery {
    /// Namespace key.
    pub key: String,
    pub period: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LatencyInfo {
    pub lookup_ok: bool,
    pub queue: Duration,
    pub query: Duration,
    pub bounds_ok: bool,
}

/// Monitor window, as offsets back from now: `[now - start, now - end]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorQuery {
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorInfo {
    pub created: DateTime<Utc>,
    pub span: Duration,
    pub n: u64,
    pub n_failed: u64,
    pub avg_latency: Duration,
    pub avg_score: f64,
    pub avg_score_no_fails: f64,
    pub avg_satisfaction: f64,
}

impl From<MonitorStats> for MonitorInfo {
    fn from(stats: MonitorStats) -> Self {
        Self {
            created: stats.created,
            span: stats.span,
            n: stats.n,
            n_failed: stats.n_failed,
            avg_latency: stats.avg_latency,
            avg_score: stats.avg_score,
            avg_score_no_fails: stats.avg_score_no_fails,
            avg_satisfaction: stats.avg_satisfaction,
        }
    }
}

/// One request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Ping(RpcArgs<bool>),
    AddData(RpcArgs<Vec<AddDataItem>>),
    KnnEager(RpcArgs<KnnArgs>),
    Namespaces(RpcArgs<bool>),
    Namespace(RpcArgs<String>),
    Dim(RpcArgs<String>),
    Len(RpcArgs<String>),
    Cap(RpcArgs<String>),
    KnnLatency(RpcArgs<LatencyQuery>),
    KnnMonitor(RpcArgs<MonitorQuery>),
}

impl Request {
    /// The send timestamp stamped by the caller, whatever the variant.
    pub fn send_time(&self) -> DateTime<Utc> {
        match self {
            Request::Ping(a) => a.send_time,
            Request::AddData(a) => a.send_time,
            Request::KnnEager(a) => a.send_time,
            Request::Namespaces(a) => a.send_time,
            Request::Namespace(a) => a.send_time,
            Request::Dim(a) => a.send_time,
            Request::Len(a) => a.send_time,
            Request::Cap(a) => a.send_time,
            Request::KnnLatency(a) => a.send_time,
            Request::KnnMonitor(a) => a.send_time,
        }
    }
}

/// One response frame, paired with the request variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ping(RpcResp<bool>),
    AddData(RpcResp<Vec<bool>>),
    KnnEager(RpcResp<KnnEagerResult>),
    Namespaces(RpcResp<Vec<String>>),
    Namespace(RpcResp<bool>),
    Dim(RpcResp<DimInfo>),
    Len(RpcResp<LenInfo>),
    Cap(RpcResp<CapInfo>),
    KnnLatency(RpcResp<LatencyInfo>),
    KnnMonitor(RpcResp<MonitorInfo>),
}

impl Response {
    /// The receive timestamp stamped by the server, whatever the variant.
    pub fn recv_time(&self) -> DateTime<Utc> {
        match self {
            Response::Ping(r) => r.recv_time,
            Response::AddData(r) => r.recv_time,
            Response::KnnEager(r) => r.recv_time,
            Response::Namespaces(r) => r.recv_time,
            Response::Namespace(r) => r.recv_time,
            Response::Dim(r) => r.recv_time,
            Response::Len(r) => r.recv_time,
            Response::Cap(r) => r.recv_time,
            Response::KnnLatency(r) => r.recv_time,
            Response::KnnMonitor(r) => r.recv_time,
        }
    }
}

/// Write one length-prefixed MessagePack frame.
pub(crate) async fn write_frame<S, T>(stream: &mut S, value: &T) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::internal("frame exceeds size limit"));
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed MessagePack frame.
pub(crate) async fn read_frame<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::network("oversized frame"));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(rmp_serde::from_slice(&body)?)
}

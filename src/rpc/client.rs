//! Single-shot RPC client
//!
//! One call, one TCP connection. The dial is bounded by the configured
//! timeout; the caller-visible latency (`recv_time - send_time`) is
//! reported even when the call errors, falling back to elapsed wall time
//! when no response envelope exists to read a receive stamp from.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::knn::KnnArgs;
use crate::rpc::{
    read_frame, write_frame, AddDataItem, CapInfo, DimInfo, KnnEagerResult, LatencyInfo,
    LatencyQuery, LenInfo, MonitorInfo, MonitorQuery, Request, Response, RpcArgs,
    DEFAULT_DIAL_TIMEOUT,
};
use crate::{Error, Result};

/// Outcome of one call against one peer. Errors are per-peer: they never
/// fail sibling calls in a fan-out.
#[derive(Debug)]
pub struct PeerResult<T> {
    pub addr: String,
    /// Network round-trip as observed by this caller.
    pub latency: Duration,
    pub result: Result<T>,
}

impl<T> PeerResult<T> {
    pub fn ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    timeout: Duration,
}

impl RpcClient {
    /// `timeout` falls back to [`DEFAULT_DIAL_TIMEOUT`] when unset or
    /// non-positive.
    pub fn new(addr: impl Into<String>, timeout: Option<Duration>) -> Self {
        let timeout = match timeout {
            Some(t) if !t.is_zero() => t,
            _ => DEFAULT_DIAL_TIMEOUT,
        };
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn ping(&self, payload: bool) -> PeerResult<bool> {
        self.unary(Request::Ping(RpcArgs::now(payload)), |resp| match resp {
            Response::Ping(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn add_data(&self, items: Vec<AddDataItem>) -> PeerResult<Vec<bool>> {
        self.unary(Request::AddData(RpcArgs::now(items)), |resp| match resp {
            Response::AddData(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn knn_eager(&self, args: KnnArgs) -> PeerResult<KnnEagerResult> {
        self.unary(Request::KnnEager(RpcArgs::now(args)), |resp| match resp {
            Response::KnnEager(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn namespaces(&self) -> PeerResult<Vec<String>> {
        self.unary(Request::Namespaces(RpcArgs::now(true)), |resp| match resp {
            Response::Namespaces(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn namespace(&self, namespace: String) -> PeerResult<bool> {
        self.unary(Request::Namespace(RpcArgs::now(namespace)), |resp| {
            match resp {
                Response::Namespace(r) => Ok(r.payload),
                other => Err(unexpected(other)),
            }
        })
        .await
    }

    pub async fn dim(&self, namespace: String) -> PeerResult<DimInfo> {
        self.unary(Request::Dim(RpcArgs::now(namespace)), |resp| match resp {
            Response::Dim(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn len(&self, namespace: String) -> PeerResult<LenInfo> {
        self.unary(Request::Len(RpcArgs::now(namespace)), |resp| match resp {
            Response::Len(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn cap(&self, namespace: String) -> PeerResult<CapInfo> {
        self.unary(Request::Cap(RpcArgs::now(namespace)), |resp| match resp {
            Response::Cap(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn knn_latency(&self, query: LatencyQuery) -> PeerResult<LatencyInfo> {
        self.unary(Request::KnnLatency(RpcArgs::now(query)), |resp| match resp {
            Response::KnnLatency(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    pub async fn knn_monitor(&self, query: MonitorQuery) -> PeerResult<MonitorInfo> {
        self.unary(Request::KnnMonitor(RpcArgs::now(query)), |resp| match resp {
            Response::KnnMonitor(r) => Ok(r.payload),
            other => Err(unexpected(other)),
        })
        .await
    }

    async fn unary<T>(
        &self,
        request: Request,
        extract: fn(Response) -> Result<T>,
    ) -> PeerResult<T> {
        let send_time = request.send_time();
        let started = Instant::now();

        match self.round_trip(&request).await {
            Ok(response) => {
                let latency = (response.recv_time() - send_time)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                PeerResult {
                    addr: self.addr.clone(),
                    latency,
                    result: extract(response),
                }
            }
            Err(e) => PeerResult {
                addr: self.addr.clone(),
                latency: started.elapsed(),
                result: Err(e),
            },
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| Error::DeadlineExceeded)?
            .map_err(|e| Error::network(format!("dial {}: {}", self.addr, e)))?;

        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    }
}

fn unexpected(response: Response) -> Error {
    Error::network(format!("unexpected response variant: {:?}", response))
}

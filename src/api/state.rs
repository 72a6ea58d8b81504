//! Shared state behind the HTTP facade

use std::sync::Arc;
use std::time::Duration;

use crate::ops::{AddrSet, RpcLifecycle};
use crate::rpc::CompositeClient;

/// One node's handle: the peer address set and the lifecycle of its
/// embedded RPC server. All state hangs off this handle; nothing is
/// process-global.
pub struct NodeState {
    pub addrs: AddrSet,
    pub lifecycle: RpcLifecycle,
    io_timeout: Duration,
}

pub type SharedState = Arc<NodeState>;

impl NodeState {
    pub fn new(io_timeout: Duration, addr_update_frequency: Duration) -> SharedState {
        Arc::new(Self {
            addrs: AddrSet::new(addr_update_frequency, io_timeout),
            lifecycle: RpcLifecycle::new(),
            io_timeout,
        })
    }

    /// Composite client over the currently maintained peer set.
    pub async fn composite(&self) -> CompositeClient {
        let addrs = self.addrs.list_maintained().await;
        CompositeClient::new(addrs, Some(self.io_timeout))
    }
}

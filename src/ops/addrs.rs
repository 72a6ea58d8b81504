//! Maintained peer address set
//!
//! A process-handle-scoped set of peer RPC addresses. Listing with
//! maintenance pings every known address (at most once per update
//! frequency) and drops the ones that fail; a momentarily slow peer is
//! removed on its first strike and must be re-added by a peer.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::rpc::CompositeClient;

struct Inner {
    addrs: BTreeSet<String>,
    last_maintained: Option<Instant>,
}

pub struct AddrSet {
    inner: Mutex<Inner>,
    update_frequency: Duration,
    client_timeout: Duration,
}

impl AddrSet {
    pub fn new(update_frequency: Duration, client_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                addrs: BTreeSet::new(),
                last_maintained: None,
            }),
            update_frequency,
            client_timeout,
        }
    }

    /// Union new addresses into the set; returns the resulting set.
    pub async fn add(&self, addrs: Vec<String>) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        inner.addrs.extend(addrs);
        inner.addrs.iter().cloned().collect()
    }

    pub async fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.addrs.iter().cloned().collect()
    }

    /// List after a maintenance pass, run at most once per update
    /// frequency. Concurrent callers serialize on the set's mutex.
    pub async fn list_maintained(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;

        let due = match inner.last_maintained {
            Some(last) => last.elapsed() >= self.update_frequency,
            None => true,
        };
        if due && !inner.addrs.is_empty() {
            let addrs: Vec<String> = inner.addrs.iter().cloned().collect();
            let composite = CompositeClient::new(addrs, Some(self.client_timeout));
            let mut rx = composite.ping();
            while let Some(peer) = rx.recv().await {
                if !matches!(peer.result, Ok(true)) {
                    tracing::info!("dropping unresponsive peer {}", peer.addr);
                    inner.addrs.remove(&peer.addr);
                }
            }
            inner.last_maintained = Some(Instant::now());
        }

        inner.addrs.iter().cloned().collect()
    }
}

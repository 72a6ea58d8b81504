//! RPC server lifecycle
//!
//! A two-level state machine: an outer mutex guards the state enum so
//! status queries never wait behind a long start or stop, and an inner
//! mutex owns the running manager/server pair. Legal transitions are
//! Default|Stopped -> Starting -> Started and Started -> Stopping ->
//! Stopped; everything else is a conflict carrying the current state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::manager::{ManagerConfig, RequestManager};
use crate::rpc::{RpcServer, RpcServerHandle};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Default,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Everything needed to bring the embedded RPC server up.
#[derive(Debug, Clone)]
pub struct StartConfig {
    /// Listen address for the RPC endpoint, e.g. `127.0.0.1:0`.
    pub rpc_addr: String,
    pub manager: ManagerConfig,
}

struct RunningNode {
    manager: Arc<RequestManager>,
    server: RpcServerHandle,
}

pub struct RpcLifecycle {
    state: StdMutex<LifecycleState>,
    inner: Mutex<Option<RunningNode>>,
}

impl Default for RpcLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcLifecycle {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(LifecycleState::Default),
            inner: Mutex::new(None),
        }
    }

    /// Current state; never blocks behind a running start/stop.
    pub fn status(&self) -> LifecycleState {
        *self.state.lock().expect("lifecycle state lock poisoned")
    }

    /// Bring the RPC server up. Returns [`LifecycleState::Started`], or a
    /// conflict with the current state when the transition is illegal. A
    /// bind failure rolls the state back to where it came from.
    pub async fn start(&self, config: StartConfig) -> Result<LifecycleState> {
        let origin = {
            let mut state = self.state.lock().expect("lifecycle state lock poisoned");
            match *state {
                origin @ (LifecycleState::Default | LifecycleState::Stopped) => {
                    *state = LifecycleState::Starting;
                    origin
                }
                current => return Err(Error::Conflict(current)),
            }
        };

        let mut inner = self.inner.lock().await;
        let manager = RequestManager::new(config.manager);
        match RpcServer::new(Arc::clone(&manager))
            .bind(&config.rpc_addr)
            .await
        {
            Ok(server) => {
                *inner = Some(RunningNode { manager, server });
                self.set_state(LifecycleState::Started);
                Ok(LifecycleState::Started)
            }
            Err(e) => {
                manager.shutdown();
                self.set_state(origin);
                Err(e)
            }
        }
    }

    /// Tear the RPC server down: cancel the manager (which cancels every
    /// in-flight request and maintenance) and close the listener.
    pub async fn stop(&self) -> Result<LifecycleState> {
        {
            let mut state = self.state.lock().expect("lifecycle state lock poisoned");
            match *state {
                LifecycleState::Started => *state = LifecycleState::Stopping,
                current => return Err(Error::Conflict(current)),
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(node) = inner.take() {
            node.manager.shutdown();
            node.server.stop().await;
        }
        self.set_state(LifecycleState::Stopped);
        Ok(LifecycleState::Stopped)
    }

    /// Listen address of the running server, if started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().await;
        inner.as_ref().map(|node| node.server.local_addr())
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().expect("lifecycle state lock poisoned") = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StartConfig {
        StartConfig {
            rpc_addr: "127.0.0.1:0".to_string(),
            manager: ManagerConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let lifecycle = RpcLifecycle::new();
        assert_eq!(lifecycle.status(), LifecycleState::Default);

        assert_eq!(
            lifecycle.start(config()).await.unwrap(),
            LifecycleState::Started
        );
        assert_eq!(lifecycle.status(), LifecycleState::Started);
        assert!(lifecycle.local_addr().await.is_some());

        assert_eq!(lifecycle.stop().await.unwrap(), LifecycleState::Stopped);
        assert_eq!(lifecycle.status(), LifecycleState::Stopped);
        assert!(lifecycle.local_addr().await.is_none());

        // Stopped is a legal start origin.
        assert_eq!(
            lifecycle.start(config()).await.unwrap(),
            LifecycleState::Started
        );
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_is_conflict() {
        let lifecycle = RpcLifecycle::new();
        lifecycle.start(config()).await.unwrap();

        match lifecycle.start(config()).await {
            Err(Error::Conflict(state)) => assert_eq!(state, LifecycleState::Started),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_conflict() {
        let lifecycle = RpcLifecycle::new();
        match lifecycle.stop().await {
            Err(Error::Conflict(state)) => assert_eq!(state, LifecycleState::Default),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_double_stop_is_conflict() {
        let lifecycle = RpcLifecycle::new();
        lifecycle.start(config()).await.unwrap();
        lifecycle.stop().await.unwrap();

        match lifecycle.stop().await {
            Err(Error::Conflict(state)) => assert_eq!(state, LifecycleState::Stopped),
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let lifecycle = RpcLifecycle::new();
        let bad = StartConfig {
            rpc_addr: "256.0.0.1:1".to_string(),
            manager: ManagerConfig::default(),
        };
        assert!(lifecycle.start(bad).await.is_err());
        assert_eq!(lifecycle.status(), LifecycleState::Default);

        // The rollback leaves the machine startable.
        assert_eq!(
            lifecycle.start(config()).await.unwrap(),
            LifecycleState::Started
        );
        lifecycle.stop().await.unwrap();
    }
}

//! Bounded search spaces
//!
//! A search space is a capped, insertion-ordered sequence of vector
//! containers for a single namespace. At most one scan or one maintenance
//! sweep runs at a time per space; concurrent scans across distinct spaces
//! are what the KNN pipeline fans out over.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::store::VectorContainer;
use crate::vector::SharedVector;
use crate::{Error, Result};

/// Capped ordered sequence of vector containers with uniform dimension.
pub struct SearchSpace {
    dim: usize,
    cap: usize,

    /// Containers in insertion order. Appends and index reads take the
    /// lock briefly; it is never held across an await point.
    containers: RwLock<Vec<VectorContainer>>,

    /// Serializes scans and maintenance sweeps against each other.
    scan_lock: Mutex<()>,
}

impl SearchSpace {
    pub fn new(dim: usize, cap: usize) -> Self {
        Self {
            dim,
            cap,
            containers: RwLock::new(Vec::new()),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.containers.read().expect("container lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live (non-deletable) containers.
    pub fn len_live(&self) -> usize {
        let now = Utc::now();
        self.containers
            .read()
            .expect("container lock poisoned")
            .iter()
            .filter(|c| !c.deletable(now))
            .count()
    }

    /// Append a container if the space has room and the dimension matches.
    pub fn add(&self, container: VectorContainer) -> Result<()> {
        let dim = container
            .dim()
            .ok_or_else(|| Error::invalid_argument("cannot add a released container"))?;
        if dim != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                got: dim,
            });
        }

        let mut containers = self.containers.write().expect("container lock poisoned");
        if containers.len() >= self.cap {
            return Err(Error::full("search space at capacity"));
        }
        containers.push(container);
        Ok(())
    }

    /// Scan containers in insertion order, handing each live vector to the
    /// consumer.
    ///
    /// Stops after `ceil(len * extent)` containers, when the consumer
    /// returns `false`, or on cancel. Serialized with [`Self::maintain`];
    /// returns the number of vectors consumed.
    pub async fn scan<F, Fut>(
        &self,
        extent: f64,
        cancel: &CancellationToken,
        mut consumer: F,
    ) -> usize
    where
        F: FnMut(SharedVector) -> Fut,
        Fut: Future<Output = bool>,
    {
        let _guard = self.scan_lock.lock().await;

        let len = self.len();
        let limit = (len as f64 * extent.clamp(0.0, 1.0)).ceil() as usize;
        let now = Utc::now();
        let mut consumed = 0;

        for i in 0..limit.min(len) {
            if cancel.is_cancelled() {
                break;
            }

            // Take the lock only long enough to clone out the shared vector.
            let vector = {
                let containers = self.containers.read().expect("container lock poisoned");
                match containers.get(i) {
                    Some(c) if !c.deletable(now) => c.vector().cloned(),
                    _ => None,
                }
            };

            if let Some(vector) = vector {
                consumed += 1;
                if !consumer(vector).await {
                    break;
                }
            }
        }

        consumed
    }

    /// Sweep once, compacting out deletable containers.
    ///
    /// Serialized with scans. `sleep_per_item` yields between items so a
    /// sweep over a large space stays cooperative.
    pub async fn maintain(&self, sleep_per_item: Duration) -> usize {
        let _guard = self.scan_lock.lock().await;

        let mut removed = 0;
        let mut i = 0;
        loop {
            {
                let mut containers = self.containers.write().expect("container lock poisoned");
                if i >= containers.len() {
                    break;
                }
                if containers[i].deletable(Utc::now()) {
                    containers.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
            if !sleep_per_item.is_zero() {
                tokio::time::sleep(sleep_per_item).await;
            }
        }
        removed
    }
}

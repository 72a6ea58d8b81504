//! Namespaced search-space sets
//!
//! The set owns every search space on a node, keyed by namespace. Each
//! namespace fixes its vector dimension at first admission and is bounded
//! to `spaces_max_n` spaces of `space_cap` containers each. A background
//! maintenance task sweeps one space per tick, round-robin.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::{SearchSpace, VectorContainer};
use crate::{Error, Result};

/// Capacity bounds for a [`SearchSpaceSet`].
#[derive(Debug, Clone, Copy)]
pub struct SetConfig {
    /// Max containers per search space.
    pub space_cap: usize,
    /// Max search spaces per namespace.
    pub spaces_max_n: usize,
}

struct NamespaceSpaces {
    dim: usize,
    spaces: Vec<Arc<SearchSpace>>,
}

/// Mapping from namespace to its ordered search spaces.
pub struct SearchSpaceSet {
    namespaces: DashMap<String, NamespaceSpaces>,
    config: SetConfig,
}

impl SearchSpaceSet {
    pub fn new(config: SetConfig) -> Self {
        Self {
            namespaces: DashMap::new(),
            config,
        }
    }

    /// Admit a container into a namespace.
    ///
    /// The namespace dimension is fixed by the first admission; later
    /// mismatches are rejected. A new space is allocated only when every
    /// existing space is at capacity and the namespace is below its space
    /// count bound.
    pub fn add(&self, namespace: &str, container: VectorContainer) -> Result<()> {
        let dim = container
            .dim()
            .ok_or_else(|| Error::invalid_argument("cannot admit a released container"))?;

        // The entry guard is exclusive for this namespace; all admissions
        // funnel through it, so a non-full space stays non-full below.
        let mut entry = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| NamespaceSpaces {
                dim,
                spaces: Vec::new(),
            });

        if entry.dim != dim {
            return Err(Error::DimensionMismatch {
                expected: entry.dim,
                got: dim,
            });
        }

        if let Some(space) = entry.spaces.iter().find(|s| s.len() < s.cap()) {
            return space.add(container);
        }

        if entry.spaces.len() >= self.config.spaces_max_n {
            return Err(Error::full("namespace at search space count limit"));
        }

        let space = Arc::new(SearchSpace::new(dim, self.config.space_cap));
        space.add(container)?;
        entry.spaces.push(space);
        Ok(())
    }

    /// Snapshot of the first `ceil(n * extent)` spaces of a namespace, in
    /// creation order. Returns `None` for an unknown namespace.
    pub fn scan_spaces(&self, namespace: &str, extent: f64) -> Option<Vec<Arc<SearchSpace>>> {
        let entry = self.namespaces.get(namespace)?;
        let n = entry.spaces.len();
        let take = (n as f64 * extent.clamp(0.0, 1.0)).ceil() as usize;
        Some(entry.spaces.iter().take(take.min(n)).cloned().collect())
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    pub fn dim(&self, namespace: &str) -> Option<usize> {
        self.namespaces.get(namespace).map(|e| e.dim)
    }

    /// `(search spaces, vectors summed)` for a namespace. Stale-tolerant:
    /// the counts may lag concurrent writers.
    pub fn len(&self, namespace: &str) -> Option<(usize, usize)> {
        let entry = self.namespaces.get(namespace)?;
        let vectors = entry.spaces.iter().map(|s| s.len()).sum();
        Some((entry.spaces.len(), vectors))
    }

    pub fn cap(&self, namespace: &str) -> Option<usize> {
        self.namespaces
            .get(namespace)
            .map(|_| self.config.space_cap)
    }

    /// Spawn the maintenance task: every `interval`, sweep one space,
    /// round-robin across namespaces. Sweep failures never escape; the
    /// next tick retries.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        sleep_per_item: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            let mut cursor: usize = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let spaces = set.all_spaces();
                if spaces.is_empty() {
                    continue;
                }
                let space = &spaces[cursor % spaces.len()];
                cursor = cursor.wrapping_add(1);

                let removed = space.maintain(sleep_per_item).await;
                if removed > 0 {
                    tracing::debug!("maintenance sweep removed {} containers", removed);
                }
            }
        })
    }

    fn all_spaces(&self) -> Vec<Arc<SearchSpace>> {
        let names = self.namespaces();
        let mut out = Vec::new();
        for name in names {
            if let Some(entry) = self.namespaces.get(&name) {
                out.extend(entry.spaces.iter().cloned());
            }
        }
        out
    }
}

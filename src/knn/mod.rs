//! KNN request arguments and the staged search pipeline

mod pipeline;
mod topk;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vector::{DistanceKind, Vector};

pub use pipeline::{spawn_pipeline, PipelineParams};
pub use topk::{better, ScoreItem, Slot, TopK};

/// One KNN request.
///
/// `extent` is the fraction of the namespace's search spaces to scan;
/// `accept` allows early termination once K results at least that good are
/// held; `reject` drops candidates at scoring. Both thresholds follow the
/// `ascending` direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnArgs {
    pub namespace: String,
    pub priority: usize,
    pub query: Vector,
    pub distance: DistanceKind,
    pub ascending: bool,
    pub k: usize,
    pub extent: f64,
    pub accept: f64,
    pub reject: f64,
    pub ttl: Duration,
    pub monitor: bool,
}

impl KnnArgs {
    /// Validate the request shape. The namespace may be any string,
    /// including empty; it names a partition, nothing more.
    pub fn ok(&self) -> bool {
        self.priority >= 1
            && self.k >= 1
            && self.extent > 0.0
            && self.extent <= 1.0
            && !self.ttl.is_zero()
            && !self.accept.is_nan()
            && !self.reject.is_nan()
    }
}

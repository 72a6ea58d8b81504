//! Vectors and distance primitives
//!
//! A [`Vector`] is an immutable fixed-length sequence of finite `f64`
//! components. Shared read access across scan workers goes through
//! [`SharedVector`], which is just an `Arc` over the value. The two
//! distance functions form a closed set, selected by [`DistanceKind`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Concurrency-safe wrapper for shared read access to a vector.
pub type SharedVector = Arc<Vector>;

/// Immutable fixed-dimension vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Vector(Vec<f64>);

impl Vector {
    /// Create a vector, rejecting empty input and non-finite components.
    pub fn new(components: Vec<f64>) -> Result<Self> {
        if components.is_empty() {
            return Err(Error::invalid_argument("vector must not be empty"));
        }
        if let Some(c) = components.iter().find(|c| !c.is_finite()) {
            return Err(Error::invalid_argument(format!(
                "vector component is not finite: {}",
                c
            )));
        }
        Ok(Self(components))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, i: usize) -> Option<f64> {
        self.0.get(i).copied()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl TryFrom<Vec<f64>> for Vector {
    type Error = Error;

    fn try_from(components: Vec<f64>) -> Result<Self> {
        Vector::new(components)
    }
}

impl From<Vector> for Vec<f64> {
    fn from(v: Vector) -> Self {
        v.0
    }
}

/// Distance function selector.
///
/// Euclidean distance is lower-is-better (ascending), cosine similarity is
/// higher-is-better (descending). The direction is asserted by the caller
/// per query; pairing a function with the wrong direction is legal but
/// meaningless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DistanceKind {
    Euclidean,
    Cosine,
}

impl DistanceKind {
    /// Score two equal-dimension vectors with the selected function.
    pub fn score(&self, a: &Vector, b: &Vector) -> Result<f64> {
        match self {
            DistanceKind::Euclidean => euclidean_distance(a, b),
            DistanceKind::Cosine => cosine_similarity(a, b),
        }
    }
}

impl TryFrom<u8> for DistanceKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(DistanceKind::Euclidean),
            1 => Ok(DistanceKind::Cosine),
            other => Err(Error::invalid_argument(format!(
                "unknown distance method: {}",
                other
            ))),
        }
    }
}

impl From<DistanceKind> for u8 {
    fn from(k: DistanceKind) -> Self {
        match k {
            DistanceKind::Euclidean => 0,
            DistanceKind::Cosine => 1,
        }
    }
}

/// Euclidean (L2) distance. Lower is better.
pub fn euclidean_distance(a: &Vector, b: &Vector) -> Result<f64> {
    check_dims(a, b)?;
    let sum: f64 = a
        .as_slice()
        .iter()
        .zip(b.as_slice())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(sum.sqrt())
}

/// Cosine similarity. Higher is better. A zero-magnitude operand yields 0.0.
pub fn cosine_similarity(a: &Vector, b: &Vector) -> Result<f64> {
    check_dims(a, b)?;
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn check_dims(a: &Vector, b: &Vector) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(Error::DimensionMismatch {
            expected: a.dim(),
            got: b.dim(),
        });
    }
    Ok(())
}

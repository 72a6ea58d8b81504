//! Vector containers
//!
//! A container is the owning cell a search space scans over: either a live
//! vector or a tombstone, an opaque payload, and an optional expiration.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::vector::SharedVector;

/// Owning cell for one vector plus its payload.
///
/// A container is *deletable* once its vector has been released or its
/// expiration has passed; the maintenance sweep compacts deletable
/// containers out of the space.
#[derive(Debug, Clone)]
pub struct VectorContainer {
    id: String,
    vector: Option<SharedVector>,
    payload: Bytes,
    expires_at: Option<DateTime<Utc>>,
}

impl VectorContainer {
    pub fn new(vector: SharedVector, payload: Bytes) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            vector: Some(vector),
            payload,
            expires_at: None,
        }
    }

    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Stable ID for the container lifetime. Not persisted.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vector(&self) -> Option<&SharedVector> {
        self.vector.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn dim(&self) -> Option<usize> {
        self.vector.as_ref().map(|v| v.dim())
    }

    /// Release the vector, turning the container into a tombstone.
    pub fn release(&mut self) {
        self.vector = None;
    }

    pub fn deletable(&self, now: DateTime<Utc>) -> bool {
        if self.vector.is_none() {
            return true;
        }
        match self.expires_at {
            Some(expires) => expires <= now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Vector;
    use std::sync::Arc;

    fn container() -> VectorContainer {
        let v = Arc::new(Vector::new(vec![1.0, 2.0]).unwrap());
        VectorContainer::new(v, Bytes::new())
    }

    #[test]
    fn test_live_container_is_not_deletable() {
        let c = container();
        assert!(!c.deletable(Utc::now()));
        assert_eq!(c.dim(), Some(2));
    }

    #[test]
    fn test_released_container_is_deletable() {
        let mut c = container();
        c.release();
        assert!(c.deletable(Utc::now()));
        assert_eq!(c.dim(), None);
    }

    #[test]
    fn test_expired_container_is_deletable() {
        let now = Utc::now();
        let c = container().with_expiration(now - chrono::Duration::seconds(1));
        assert!(c.deletable(now));

        let c = container().with_expiration(now + chrono::Duration::seconds(60));
        assert!(!c.deletable(now));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(container().id(), container().id());
    }
}

//! Vector store: containers, search spaces, and the namespaced set
//!
//! This layer is the scannable substrate the KNN pipeline runs over. It
//! holds no index structure; accuracy/latency trade-offs are made at query
//! time via extent and the accept/reject thresholds.

mod container;
mod set;
mod space;

pub use container::VectorContainer;
pub use set::{SearchSpaceSet, SetConfig};
pub use space::SearchSpace;

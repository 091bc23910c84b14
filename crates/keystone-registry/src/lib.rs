//! keystone-registry — versioned node manifests and the dependency graph
//!
//! The registry is the source of truth. Readers work against immutable
//! [`RegistrySnapshot`]s; writers commit through a single serialized
//! cycle-check-and-swap, and every commit is announced on the graph-change topic.

pub mod graph;
pub mod registry;
pub mod status;

pub use graph::DependencyGraph;
pub use registry::{NodeView, Registry, RegistrySnapshot};
pub use status::StatusTracker;

//! Node builders and their registry
//!
//! A builder turns a manifest into the node's observable post-build state.
//! Builders are registered per node; nodes without one use the registry's
//! default builder.

use keystone_core::{Manifest, NodeId, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a builder may look at for one attempt.
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub build_id: String,
    pub generation: u64,
    /// 1-based attempt number within this build.
    pub attempt: u32,
    /// Live state of each dependency at the time the build started.
    pub dependencies: BTreeMap<NodeId, Value>,
    pub cancel: CancellationToken,
}

/// Produces a node's post-build state from its manifest and dependency states.
///
/// Returning `Err` counts as a transient build failure and is retried with
/// backoff until the orchestrator's attempt limit is reached.
#[async_trait::async_trait]
pub trait NodeBuilder: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, manifest: &Manifest, ctx: &BuildContext) -> Result<Value>;

    /// Build with cancellation support. Default: race build() against cancellation.
    async fn build_cancellable(&self, manifest: &Manifest, ctx: &BuildContext) -> Result<Value> {
        tokio::select! {
            result = self.build(manifest, ctx) => result,
            _ = ctx.cancel.cancelled() => Err(keystone_core::Error::build_failure(
                &manifest.id,
                ctx.attempt,
                "cancelled",
            )),
        }
    }
}

/// Publishes the manifest's declared `params` as the node's state.
pub struct ManifestBuilder;

#[async_trait::async_trait]
impl NodeBuilder for ManifestBuilder {
    fn name(&self) -> &str {
        "manifest"
    }

    async fn build(&self, manifest: &Manifest, _ctx: &BuildContext) -> Result<Value> {
        Ok(manifest.params.clone())
    }
}

pub struct BuilderRegistry {
    builders: HashMap<NodeId, Arc<dyn NodeBuilder>>,
    default: Arc<dyn NodeBuilder>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            default: Arc::new(ManifestBuilder),
        }
    }

    /// Register a builder for one node. Replaces any existing one.
    pub fn register(&mut self, node: impl Into<NodeId>, builder: impl NodeBuilder + 'static) {
        self.builders.insert(node.into(), Arc::new(builder));
    }

    pub fn register_shared(&mut self, node: impl Into<NodeId>, builder: Arc<dyn NodeBuilder>) {
        self.builders.insert(node.into(), builder);
    }

    pub fn set_default(&mut self, builder: impl NodeBuilder + 'static) {
        self.default = Arc::new(builder);
    }

    pub fn remove(&mut self, node: &NodeId) -> bool {
        self.builders.remove(node).is_some()
    }

    pub fn for_node(&self, node: &NodeId) -> Arc<dyn NodeBuilder> {
        self.builders
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn names(&self) -> Vec<(NodeId, String)> {
        let mut out: Vec<_> = self
            .builders
            .iter()
            .map(|(id, b)| (id.clone(), b.name().to_string()))
            .collect();
        out.sort();
        out
    }
}

//! Registry — versioned manifest store with copy-on-write snapshots.

use crate::graph::DependencyGraph;
use dashmap::DashMap;
use keystone_bus::EventBus;
use keystone_core::{
    Error, Event, GraphChange, Manifest, NodeId, NodeStatus, Payload, Result, StateStore,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// Immutable view of the registry at one graph version.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub version: u64,
    manifests: BTreeMap<NodeId, Arc<Manifest>>,
    graph: DependencyGraph,
}

impl RegistrySnapshot {
    pub fn get(&self, id: &NodeId) -> Option<&Arc<Manifest>> {
        self.manifests.get(id)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &Arc<Manifest>> {
        self.manifests.values()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn dependents_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.graph.dependents_of(id)
    }
}

/// A node's manifest together with its current lifecycle status.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub manifest: Arc<Manifest>,
    pub status: NodeStatus,
}

pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
    /// Serializes the cycle-check-and-swap; held for nothing else.
    commit: tokio::sync::Mutex<()>,
    statuses: DashMap<NodeId, (NodeStatus, Option<String>)>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
}

impl Registry {
    /// Open the registry over persisted manifests.
    pub async fn open(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Result<Self> {
        let manifests = store.load_manifests().await?;
        let graph = DependencyGraph::build(manifests.iter())?;
        let statuses = DashMap::new();
        for m in &manifests {
            statuses.insert(m.id.clone(), (NodeStatus::Registered, None));
        }
        let snapshot = RegistrySnapshot {
            version: 0,
            manifests: manifests
                .into_iter()
                .map(|m| (m.id.clone(), Arc::new(m)))
                .collect(),
            graph,
        };
        info!(nodes = snapshot.len(), location = %store.location(), "registry opened");
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            commit: tokio::sync::Mutex::new(()),
            statuses,
            store,
            bus,
        })
    }

    /// Current immutable snapshot. Never observes a partially applied update.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn swap(&self, next: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let next = Arc::new(next);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        next
    }

    pub fn get(&self, id: &NodeId) -> Result<NodeView> {
        let snapshot = self.snapshot();
        let manifest = snapshot
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        Ok(NodeView {
            manifest,
            status: self.status(id).unwrap_or(NodeStatus::Registered),
        })
    }

    pub fn dependents_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.snapshot().dependents_of(id)
    }

    pub fn status(&self, id: &NodeId) -> Option<NodeStatus> {
        self.statuses.get(id).map(|e| e.0)
    }

    /// Record a status transition for the given build. Returns false when ignored.
    pub(crate) fn record_status(&self, id: &NodeId, status: NodeStatus, build_id: &str) -> bool {
        if self.snapshot().get(id).is_none() {
            return false;
        }
        let mut entry = self
            .statuses
            .entry(id.clone())
            .or_insert((NodeStatus::Registered, None));
        let same_build = entry.1.as_deref() == Some(build_id);
        // A certification outcome outranks the build's own "built" report.
        if same_build
            && status == NodeStatus::Built
            && matches!(entry.0, NodeStatus::Certified | NodeStatus::Rejected)
        {
            return false;
        }
        *entry = (status, Some(build_id.to_string()));
        true
    }

    pub async fn register(&self, manifest: Manifest) -> Result<GraphChange> {
        self.register_all(vec![manifest]).await
    }

    /// Validate and commit a batch of manifests atomically, then announce the diff.
    pub async fn register_all(&self, manifests: Vec<Manifest>) -> Result<GraphChange> {
        let mut ids = HashSet::new();
        for m in &manifests {
            m.validate()?;
            if !ids.insert(m.id.clone()) {
                return Err(Error::validation(m.id.as_str(), "manifest appears twice in batch"));
            }
        }
        if manifests.is_empty() {
            return Err(Error::validation("-", "empty registration batch"));
        }

        let (change, snapshot) = {
            let _commit = self.commit.lock().await;
            let base = self.snapshot();

            let mut next = base.manifests.clone();
            let mut change = GraphChange::default();
            for m in &manifests {
                match base.get(&m.id) {
                    Some(existing) if m.version <= existing.version => {
                        return Err(Error::validation(
                            m.id.as_str(),
                            format!(
                                "version {} is not newer than registered version {}",
                                m.version, existing.version
                            ),
                        ));
                    }
                    Some(_) => change.edited.push(m.id.clone()),
                    None => change.added.push(m.id.clone()),
                }
                next.insert(m.id.clone(), Arc::new(m.clone()));
            }

            let graph = match DependencyGraph::build(next.values().map(|m| m.as_ref())) {
                Ok(g) => g,
                Err(e) => {
                    warn!(error = %e, "registration rejected");
                    return Err(e);
                }
            };

            self.persist_batch(&manifests, &base).await?;

            change.graph_version = base.version + 1;
            let snapshot = self.swap(RegistrySnapshot {
                version: change.graph_version,
                manifests: next,
                graph,
            });
            for id in &change.added {
                self.statuses
                    .insert(id.clone(), (NodeStatus::Registered, None));
            }
            (change, snapshot)
        };

        info!(
            version = snapshot.version,
            added = change.added.len(),
            edited = change.edited.len(),
            "graph committed"
        );
        self.announce(change).await
    }

    /// Remove a manifest nothing depends on.
    pub async fn remove(&self, id: &NodeId) -> Result<GraphChange> {
        let change = {
            let _commit = self.commit.lock().await;
            let base = self.snapshot();
            if base.get(id).is_none() {
                return Err(Error::NotFound(id.clone()));
            }
            let dependents = base.graph.direct_dependents_of(id)?;
            if !dependents.is_empty() {
                return Err(Error::validation(
                    id.as_str(),
                    format!("still required by {:?}", dependents),
                ));
            }

            let mut next = base.manifests.clone();
            next.remove(id);
            let graph = DependencyGraph::build(next.values().map(|m| m.as_ref()))?;
            self.store.remove_manifest(id).await?;

            let change = GraphChange {
                removed: vec![id.clone()],
                graph_version: base.version + 1,
                ..Default::default()
            };
            self.swap(RegistrySnapshot {
                version: change.graph_version,
                manifests: next,
                graph,
            });
            self.statuses.remove(id);
            change
        };
        info!(node = %id, version = change.graph_version, "node removed");
        self.announce(change).await
    }

    /// Persist every manifest of a batch, restoring prior files if any write fails.
    async fn persist_batch(&self, manifests: &[Manifest], base: &RegistrySnapshot) -> Result<()> {
        for (i, m) in manifests.iter().enumerate() {
            if let Err(e) = self.store.put_manifest(m).await {
                error!(node = %m.id, error = %e, "manifest persistence failed, restoring batch");
                for written in &manifests[..i] {
                    let restored = match base.get(&written.id) {
                        Some(prev) => self.store.put_manifest(prev).await,
                        None => self.store.remove_manifest(&written.id).await,
                    };
                    if let Err(re) = restored {
                        error!(node = %written.id, error = %re, "manifest restore failed");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn announce(&self, change: GraphChange) -> Result<GraphChange> {
        let causal_id = format!("graph-v{}", change.graph_version);
        self.bus
            .publish(Event::new(Payload::GraphChange(change.clone()), causal_id))
            .await?;
        Ok(change)
    }
}

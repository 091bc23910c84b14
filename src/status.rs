//! Status query interface.

use chrono::{DateTime, Utc};
use keystone_certifier::FactLedger;
use keystone_core::{BuildStatus, Error, FactStatus, NodeId, NodeStatus, Result};
use keystone_orchestrator::BuildJournal;
use keystone_registry::{Registry, RegistrySnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The latest fact for a node, without its predicate detail.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FactSummary {
    pub build_id: String,
    pub status: FactStatus,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub hash: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeReport {
    pub id: NodeId,
    pub status: NodeStatus,
    pub version: u64,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fact: Option<FactSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub graph_version: u64,
    pub topological_order: Vec<NodeId>,
    pub nodes: Vec<NodeReport>,
    pub node_counts: BTreeMap<NodeStatus, usize>,
    pub build_counts: BTreeMap<BuildStatus, usize>,
    pub fact_counts: BTreeMap<FactStatus, usize>,
}

impl NodeReport {
    pub fn collect(registry: &Registry, ledger: &FactLedger, id: &NodeId) -> Result<Self> {
        Self::from_snapshot(&registry.snapshot(), registry, ledger, id)
    }

    fn from_snapshot(
        snapshot: &RegistrySnapshot,
        registry: &Registry,
        ledger: &FactLedger,
        id: &NodeId,
    ) -> Result<Self> {
        let manifest = snapshot
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let last_fact = ledger.last(id).map(|fact| FactSummary {
            failed: fact.failed_invariants(),
            build_id: fact.build_id,
            status: fact.status,
            issued_at: fact.issued_at,
            expires_at: fact.expires_at,
            hash: fact.hash,
        });
        Ok(Self {
            id: id.clone(),
            status: registry.status(id).unwrap_or(NodeStatus::Registered),
            version: manifest.version,
            dependencies: manifest.dependencies.clone(),
            dependents: snapshot.graph().direct_dependents_of(id)?,
            last_fact,
        })
    }
}

impl StatusReport {
    /// Everything is read from one registry snapshot, so nodes and order agree.
    pub fn collect(registry: &Registry, journal: &BuildJournal, ledger: &FactLedger) -> Self {
        let snapshot = registry.snapshot();
        let topological_order = snapshot.graph().topological_order().to_vec();

        let mut nodes = Vec::with_capacity(topological_order.len());
        let mut node_counts = BTreeMap::new();
        for id in &topological_order {
            if let Ok(report) = NodeReport::from_snapshot(&snapshot, registry, ledger, id) {
                *node_counts.entry(report.status).or_insert(0) += 1;
                nodes.push(report);
            }
        }

        Self {
            graph_version: snapshot.version,
            topological_order,
            nodes,
            node_counts,
            build_counts: journal.count_by_status(),
            fact_counts: ledger.count_by_status(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

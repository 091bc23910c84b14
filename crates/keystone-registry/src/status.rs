//! Node lifecycle tracking driven by build and fact events.

use crate::registry::Registry;
use keystone_bus::Subscriber;
use keystone_core::{BuildRecord, BuildStatus, Event, Fact, FactStatus, NodeId, NodeStatus, Payload, Result};
use std::sync::Arc;
use tracing::debug;

/// Folds build-status and fact events into per-node status on the [`Registry`].
///
/// Subscribe it to both `build_status` and `fact`. The two topics are dispatched
/// independently, so a fact may land before the build's own success report; the
/// registry keeps the certification outcome in that case.
pub struct StatusTracker {
    registry: Arc<Registry>,
}

impl StatusTracker {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Seed a node's status from persisted history, e.g. after a restart.
    /// `builds` are the node's journaled records, oldest first.
    pub fn restore(&self, node: &NodeId, builds: &[BuildRecord], last_fact: Option<&Fact>) {
        let latest = builds
            .iter()
            .rev()
            .find_map(|r| from_build(r.status).map(|s| (r, s)));
        let fact = match latest {
            Some((record, status)) => {
                self.registry.record_status(node, status, &record.build_id);
                last_fact.filter(|f| {
                    record.status == BuildStatus::Succeeded && f.build_id == record.build_id
                })
            }
            None => last_fact,
        };
        if let Some(fact) = fact {
            self.registry
                .record_status(node, from_fact(fact.status), &fact.build_id);
        }
    }
}

fn from_build(status: BuildStatus) -> Option<NodeStatus> {
    match status {
        BuildStatus::Pending => Some(NodeStatus::Pending),
        BuildStatus::Running => Some(NodeStatus::Running),
        BuildStatus::Succeeded => Some(NodeStatus::Built),
        BuildStatus::Failed => Some(NodeStatus::Failed),
        BuildStatus::RolledBack => Some(NodeStatus::RolledBack),
        BuildStatus::Blocked => Some(NodeStatus::Blocked),
        BuildStatus::Superseded => None,
    }
}

fn from_fact(status: FactStatus) -> NodeStatus {
    match status {
        FactStatus::Certified => NodeStatus::Certified,
        FactStatus::Rejected => NodeStatus::Rejected,
    }
}

#[async_trait::async_trait]
impl Subscriber for StatusTracker {
    fn name(&self) -> &str {
        "status-tracker"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let (node, status, build_id) = match &event.payload {
            Payload::BuildStatus(update) => match from_build(update.record.status) {
                Some(s) => (&update.record.node_id, s, update.record.build_id.as_str()),
                None => return Ok(()),
            },
            Payload::Fact(fact) => (
                &fact.node_id,
                from_fact(fact.status),
                fact.build_id.as_str(),
            ),
            _ => return Ok(()),
        };
        if self.registry.record_status(node, status, build_id) {
            debug!(node = %node, %status, build_id, "node status updated");
        }
        Ok(())
    }
}

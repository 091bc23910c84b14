//! Remediation audit trail.

use chrono::{DateTime, Utc};
use keystone_core::{NodeId, RemediationAction};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// One emitted remediation and why.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub node_id: NodeId,
    pub rule_id: String,
    pub action: RemediationAction,
    pub attempt_number: u32,
    /// Hash of the fact that fired the rule.
    pub fact_hash: String,
    /// Bus event carrying the remediation.
    pub event_id: String,
}

/// Bounded in-memory trail, newest last.
pub struct AuditTrail {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn for_node(&self, node: &NodeId) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| &e.node_id == node)
            .collect()
    }
}

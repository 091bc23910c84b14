//! Live state pointers and last-known-good snapshots.

use dashmap::DashMap;
use keystone_core::{NodeId, Result, Snapshot, StateStore};

/// Per-node live state plus the last snapshot that was certified.
#[derive(Default)]
pub struct LiveStates {
    live: DashMap<NodeId, Snapshot>,
    last_good: DashMap<NodeId, Snapshot>,
}

impl LiveStates {
    pub async fn load(store: &dyn StateStore) -> Result<Self> {
        let states = Self::default();
        for snapshot in store.load_snapshots().await? {
            states.last_good.insert(snapshot.node_id.clone(), snapshot);
        }
        for snapshot in store.load_live().await? {
            states.live.insert(snapshot.node_id.clone(), snapshot);
        }
        Ok(states)
    }

    pub fn current(&self, node: &NodeId) -> Option<Snapshot> {
        self.live.get(node).map(|s| s.clone())
    }

    pub fn last_known_good(&self, node: &NodeId) -> Option<Snapshot> {
        self.last_good.get(node).map(|s| s.clone())
    }

    /// Point the node's live state at `snapshot`, or clear it.
    pub fn swap(&self, node: &NodeId, snapshot: Option<Snapshot>) {
        match snapshot {
            Some(s) => {
                self.live.insert(node.clone(), s);
            }
            None => {
                self.live.remove(node);
            }
        }
    }

    pub fn set_last_known_good(&self, snapshot: Snapshot) {
        self.last_good.insert(snapshot.node_id.clone(), snapshot);
    }

    pub fn forget(&self, node: &NodeId) {
        self.live.remove(node);
        self.last_good.remove(node);
    }
}

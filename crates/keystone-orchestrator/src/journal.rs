//! Build journal: every build record transition, persisted append-only.

use keystone_core::{BuildRecord, BuildStatus, NodeId, Result, StateStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Entries {
    records: Vec<BuildRecord>,
    index: HashMap<String, usize>,
}

impl Entries {
    fn upsert(&mut self, record: BuildRecord) {
        match self.index.get(&record.build_id) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.build_id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// The orchestrator's view of all builds, in creation order.
pub struct BuildJournal {
    store: Arc<dyn StateStore>,
    entries: Mutex<Entries>,
}

impl BuildJournal {
    /// Load the persisted journal.
    pub async fn load(store: Arc<dyn StateStore>) -> Result<Self> {
        let mut entries = Entries::default();
        for record in store.load_builds().await? {
            entries.upsert(record);
        }
        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a transition, then make it visible to readers.
    pub async fn record(&self, record: &BuildRecord) -> Result<()> {
        self.store.record_build(record).await?;
        self.entries().upsert(record.clone());
        Ok(())
    }

    pub fn get(&self, build_id: &str) -> Option<BuildRecord> {
        let entries = self.entries();
        entries
            .index
            .get(build_id)
            .map(|&i| entries.records[i].clone())
    }

    pub fn all(&self) -> Vec<BuildRecord> {
        self.entries().records.clone()
    }

    pub fn for_node(&self, node: &NodeId) -> Vec<BuildRecord> {
        self.entries()
            .records
            .iter()
            .filter(|r| &r.node_id == node)
            .cloned()
            .collect()
    }

    /// Most recently created build for the node.
    pub fn latest(&self, node: &NodeId) -> Option<BuildRecord> {
        self.entries()
            .records
            .iter()
            .rev()
            .find(|r| &r.node_id == node)
            .cloned()
    }

    /// Builds left without a terminal status.
    pub fn unfinished(&self) -> Vec<BuildRecord> {
        self.entries()
            .records
            .iter()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect()
    }

    pub fn count_by_status(&self) -> BTreeMap<BuildStatus, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.entries().records {
            *counts.entry(r.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{MemoryStore, TriggerReason};

    #[tokio::test]
    async fn transitions_replace_in_place() {
        let store = Arc::new(MemoryStore::new());
        let journal = BuildJournal::load(store.clone()).await.unwrap();

        let node = NodeId::from("a");
        let mut record = BuildRecord::new(&node, "t1", 1, TriggerReason::Manual, 1);
        journal.record(&record).await.unwrap();
        record.status = BuildStatus::Running;
        journal.record(&record).await.unwrap();
        record.finish(BuildStatus::Succeeded, None);
        journal.record(&record).await.unwrap();

        assert_eq!(journal.all().len(), 1);
        assert_eq!(journal.latest(&node).unwrap().status, BuildStatus::Succeeded);
        assert!(journal.unfinished().is_empty());

        let reloaded = BuildJournal::load(store).await.unwrap();
        assert_eq!(reloaded.get(&record.build_id).unwrap().status, BuildStatus::Succeeded);
        assert_eq!(reloaded.count_by_status()[&BuildStatus::Succeeded], 1);
    }
}

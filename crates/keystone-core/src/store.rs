//! State store abstraction: pluggable backend for everything that must survive a restart.
//!
//! Components write manifests, fact ledgers, snapshots and the build journal through
//! [`StateStore`]. The driver decides where it goes: local filesystem or memory.

use crate::build::BuildRecord;
use crate::error::{Error, Result};
use crate::fact::Fact;
use crate::types::{Manifest, NodeId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// A node's observable state as produced by one build.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub node_id: NodeId,
    pub build_id: String,
    pub manifest_version: u64,
    pub state: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        node_id: &NodeId,
        build_id: &str,
        manifest_version: u64,
        state: serde_json::Value,
    ) -> Self {
        Self {
            node_id: node_id.clone(),
            build_id: build_id.into(),
            manifest_version,
            state,
            captured_at: Utc::now(),
        }
    }
}

/// Pluggable persistence driver.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn put_manifest(&self, manifest: &Manifest) -> Result<()>;
    async fn remove_manifest(&self, id: &NodeId) -> Result<()>;
    async fn load_manifests(&self) -> Result<Vec<Manifest>>;

    /// Append one fact to the node's ledger. Never rewrites earlier entries.
    async fn append_fact(&self, fact: &Fact) -> Result<()>;
    async fn load_ledgers(&self) -> Result<BTreeMap<NodeId, Vec<Fact>>>;

    /// Persist a node's last-known-good snapshot.
    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
    async fn remove_snapshot(&self, id: &NodeId) -> Result<()>;
    async fn load_snapshots(&self) -> Result<Vec<Snapshot>>;

    /// Persist the node's live state pointer (`None` clears it).
    async fn put_live(&self, id: &NodeId, snapshot: Option<&Snapshot>) -> Result<()>;
    async fn load_live(&self) -> Result<Vec<Snapshot>>;

    /// Journal a build record transition.
    async fn record_build(&self, record: &BuildRecord) -> Result<()>;
    /// Latest journaled version of every build, in first-seen order.
    async fn load_builds(&self) -> Result<Vec<BuildRecord>>;

    /// Physical location for human inspection.
    fn location(&self) -> String;
}

fn latest_builds(records: impl IntoIterator<Item = BuildRecord>) -> Vec<BuildRecord> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: BTreeMap<String, BuildRecord> = BTreeMap::new();
    for record in records {
        if !latest.contains_key(&record.build_id) {
            order.push(record.build_id.clone());
        }
        latest.insert(record.build_id.clone(), record);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

// ============================================================
// Filesystem driver
// ============================================================

/// Local filesystem driver. Writes under `<data_dir>/`.
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn manifest_path(&self, id: &NodeId) -> PathBuf {
        self.base_dir.join("manifests").join(format!("{}.json", id))
    }

    fn ledger_path(&self, id: &NodeId) -> PathBuf {
        self.base_dir.join("ledger").join(format!("{}.jsonl", id))
    }

    fn snapshot_path(&self, dir: &str, id: &NodeId) -> PathBuf {
        self.base_dir.join(dir).join(format!("{}.json", id))
    }

    fn journal_path(&self) -> PathBuf {
        self.base_dir.join("builds.jsonl")
    }

    /// Write via temp file + rename so readers never see a torn file.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!("wrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    async fn append_line(path: &Path, value: &impl Serialize) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Parse a JSONL file. A malformed final line is what a crash mid-append
    /// leaves behind: it is cut off so later appends start on a clean line.
    /// Malformed lines anywhere else are an error.
    async fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        let mut offset = 0usize;
        let mut lines = content.split_inclusive('\n');
        while let Some(line) = lines.next() {
            let start = offset;
            offset += line.len();
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line.trim_end()) {
                Ok(value) => out.push(value),
                Err(e) if lines.clone().all(|rest| rest.trim().is_empty()) => {
                    tracing::warn!(path = %path.display(), error = %e, "discarding torn trailing line");
                    Self::truncate(path, start as u64).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn truncate(path: &Path, len: u64) -> Result<()> {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        Ok(())
    }

    async fn read_dir_json<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl StateStore for FsStore {
    async fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        Self::write_atomic(&self.manifest_path(&manifest.id), &bytes).await
    }

    async fn remove_manifest(&self, id: &NodeId) -> Result<()> {
        match tokio::fs::remove_file(self.manifest_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_manifests(&self) -> Result<Vec<Manifest>> {
        Self::read_dir_json(&self.base_dir.join("manifests")).await
    }

    async fn append_fact(&self, fact: &Fact) -> Result<()> {
        Self::append_line(&self.ledger_path(&fact.node_id), fact).await
    }

    async fn load_ledgers(&self) -> Result<BTreeMap<NodeId, Vec<Fact>>> {
        let dir = self.base_dir.join("ledger");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ledgers = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                let facts: Vec<Fact> = Self::read_lines(&path).await?;
                if let Some(first) = facts.first() {
                    ledgers.insert(first.node_id.clone(), facts);
                }
            }
        }
        Ok(ledgers)
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        Self::write_atomic(&self.snapshot_path("snapshots", &snapshot.node_id), &bytes).await
    }

    async fn remove_snapshot(&self, id: &NodeId) -> Result<()> {
        match tokio::fs::remove_file(self.snapshot_path("snapshots", id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>> {
        Self::read_dir_json(&self.base_dir.join("snapshots")).await
    }

    async fn put_live(&self, id: &NodeId, snapshot: Option<&Snapshot>) -> Result<()> {
        let path = self.snapshot_path("live", id);
        match snapshot {
            Some(s) => Self::write_atomic(&path, &serde_json::to_vec_pretty(s)?).await,
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn load_live(&self) -> Result<Vec<Snapshot>> {
        Self::read_dir_json(&self.base_dir.join("live")).await
    }

    async fn record_build(&self, record: &BuildRecord) -> Result<()> {
        Self::append_line(&self.journal_path(), record).await
    }

    async fn load_builds(&self) -> Result<Vec<BuildRecord>> {
        let records: Vec<BuildRecord> = Self::read_lines(&self.journal_path()).await?;
        Ok(latest_builds(records))
    }

    fn location(&self) -> String {
        self.base_dir.display().to_string()
    }
}

// ============================================================
// Memory driver
// ============================================================

/// In-memory driver for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    manifests: DashMap<NodeId, Manifest>,
    ledgers: DashMap<NodeId, Vec<Fact>>,
    snapshots: DashMap<NodeId, Snapshot>,
    live: DashMap<NodeId, Snapshot>,
    journal: Mutex<Vec<BuildRecord>>,
    /// Artificial latency on live-pointer writes, in milliseconds.
    live_latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slow down live-pointer writes, to model storage slower than the rollback budget.
    pub fn set_live_latency(&self, latency: Duration) {
        self.live_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Overwrite a stored fact in place. Only useful for exercising tamper detection.
    pub fn tamper_fact(&self, id: &NodeId, position: usize, edit: impl FnOnce(&mut Fact)) {
        if let Some(mut ledger) = self.ledgers.get_mut(id) {
            if let Some(fact) = ledger.get_mut(position) {
                edit(fact);
            }
        }
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Vec<BuildRecord>> {
        self.journal.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.manifests.insert(manifest.id.clone(), manifest.clone());
        Ok(())
    }

    async fn remove_manifest(&self, id: &NodeId) -> Result<()> {
        self.manifests.remove(id);
        Ok(())
    }

    async fn load_manifests(&self) -> Result<Vec<Manifest>> {
        let mut out: Vec<Manifest> = self.manifests.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn append_fact(&self, fact: &Fact) -> Result<()> {
        self.ledgers
            .entry(fact.node_id.clone())
            .or_default()
            .push(fact.clone());
        Ok(())
    }

    async fn load_ledgers(&self) -> Result<BTreeMap<NodeId, Vec<Fact>>> {
        Ok(self
            .ledgers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .insert(snapshot.node_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove_snapshot(&self, id: &NodeId) -> Result<()> {
        self.snapshots.remove(id);
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_live(&self, id: &NodeId, snapshot: Option<&Snapshot>) -> Result<()> {
        let latency = self.live_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        match snapshot {
            Some(s) => {
                self.live.insert(id.clone(), s.clone());
            }
            None => {
                self.live.remove(id);
            }
        }
        Ok(())
    }

    async fn load_live(&self) -> Result<Vec<Snapshot>> {
        Ok(self.live.iter().map(|e| e.value().clone()).collect())
    }

    async fn record_build(&self, record: &BuildRecord) -> Result<()> {
        self.journal().push(record.clone());
        Ok(())
    }

    async fn load_builds(&self) -> Result<Vec<BuildRecord>> {
        let records = self.journal().clone();
        Ok(latest_builds(records))
    }

    fn location(&self) -> String {
        "memory".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildStatus, TriggerReason};

    #[tokio::test]
    async fn fs_manifest_roundtrip_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let m = Manifest::new("db", 1);
        store.put_manifest(&m).await.unwrap();
        store.put_manifest(&Manifest::new("api", 2).depends_on("db")).await.unwrap();

        let loaded = store.load_manifests().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id.as_str(), "api");

        store.remove_manifest(&"db".into()).await.unwrap();
        store.remove_manifest(&"db".into()).await.unwrap();
        assert_eq!(store.load_manifests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fs_journal_keeps_latest_per_build() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let mut a = BuildRecord::new(&"a".into(), "t", 1, TriggerReason::Manual, 1);
        let b = BuildRecord::new(&"b".into(), "t", 1, TriggerReason::Manual, 1);
        store.record_build(&a).await.unwrap();
        store.record_build(&b).await.unwrap();
        a.status = BuildStatus::Running;
        store.record_build(&a).await.unwrap();

        let builds = store.load_builds().await.unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].build_id, a.build_id);
        assert_eq!(builds[0].status, BuildStatus::Running);
        assert_eq!(builds[1].status, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn fs_live_pointer_clears() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let snap = Snapshot::new(&"a".into(), "b-1", 1, serde_json::json!({"ok": true}));
        store.put_live(&"a".into(), Some(&snap)).await.unwrap();
        assert_eq!(store.load_live().await.unwrap(), vec![snap]);
        store.put_live(&"a".into(), None).await.unwrap();
        assert!(store.load_live().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fs_journal_survives_torn_trailing_line() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let first = BuildRecord::new(&"a".into(), "t", 1, TriggerReason::Manual, 1);
        store.record_build(&first).await.unwrap();

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(store.journal_path())
            .await
            .unwrap();
        file.write_all(br#"{"build_id":"x","node_"#).await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let builds = store.load_builds().await.unwrap();
        assert_eq!(builds, vec![first.clone()]);

        // The torn tail is gone, so the next append lands on its own line.
        let second = BuildRecord::new(&"b".into(), "t", 1, TriggerReason::Manual, 1);
        store.record_build(&second).await.unwrap();
        assert_eq!(store.load_builds().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn fs_ledger_rejects_interior_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let path = store.ledger_path(&"a".into());
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let fact = Fact {
            node_id: "a".into(),
            build_id: "b-1".into(),
            predicate_results: vec![],
            status: crate::fact::FactStatus::Certified,
            issued_at: Utc::now(),
            expires_at: None,
            prior_hash: crate::fact::GENESIS_HASH.into(),
            signature: String::new(),
            hash: "h".into(),
        };
        let line = serde_json::to_string(&fact).unwrap();
        tokio::fs::write(&path, format!("{{\"node_id\":\"a\"\n{}\n", line))
            .await
            .unwrap();

        assert!(matches!(store.load_ledgers().await, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn fs_snapshot_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path());
        let snap = Snapshot::new(&"a".into(), "b-1", 1, serde_json::json!({}));
        store.put_snapshot(&snap).await.unwrap();
        store.remove_snapshot(&"a".into()).await.unwrap();
        store.remove_snapshot(&"a".into()).await.unwrap();
        assert!(store.load_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_fs_store_loads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsStore::new(tmp.path().join("missing"));
        assert!(store.load_manifests().await.unwrap().is_empty());
        assert!(store.load_ledgers().await.unwrap().is_empty());
        assert!(store.load_builds().await.unwrap().is_empty());
    }
}

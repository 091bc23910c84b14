//! Build records — one per (node, trigger), owned by the orchestrator.

use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a build was requested.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerReason {
    GraphChange,
    Remediation,
    Manual,
    Recovery,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GraphChange => "graph-change",
            Self::Remediation => "remediation",
            Self::Manual => "manual",
            Self::Recovery => "recovery",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
    /// A dependency did not settle successfully in this generation.
    Blocked,
    /// Cancelled by a newer generation before it acquired the node's slot.
    Superseded,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Blocked => "blocked",
            Self::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BuildRecord {
    pub build_id: String,
    pub node_id: NodeId,
    pub trigger_id: String,
    pub generation: u64,
    pub reason: TriggerReason,
    pub manifest_version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildRecord {
    pub fn new(
        node_id: &NodeId,
        trigger_id: &str,
        generation: u64,
        reason: TriggerReason,
        manifest_version: u64,
    ) -> Self {
        Self {
            build_id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.clone(),
            trigger_id: trigger_id.into(),
            generation,
            reason,
            manifest_version,
            started_at: Utc::now(),
            finished_at: None,
            attempt_count: 0,
            status: BuildStatus::Pending,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn finish(&mut self, status: BuildStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn wall_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lifecycle() {
        let mut r = BuildRecord::new(&"a".into(), "t-1", 1, TriggerReason::Manual, 1);
        assert_eq!(r.status, BuildStatus::Pending);
        assert!(!r.is_terminal());
        r.status = BuildStatus::Running;
        r.attempt_count = 1;
        r.finish(BuildStatus::Succeeded, None);
        assert!(r.is_terminal());
        assert!(r.wall_ms().is_some());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::RolledBack).unwrap(),
            r#""rolled_back""#
        );
        assert_eq!(
            serde_json::to_string(&TriggerReason::GraphChange).unwrap(),
            r#""graph-change""#
        );
    }

    #[test]
    fn trigger_reason_display_matches_wire_name() {
        for reason in [
            TriggerReason::GraphChange,
            TriggerReason::Remediation,
            TriggerReason::Manual,
            TriggerReason::Recovery,
        ] {
            let wire = serde_json::to_string(&reason).unwrap();
            assert_eq!(wire, format!("\"{}\"", reason));
        }
    }
}

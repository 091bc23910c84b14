//! Bus events. The topic is derived from the payload, so every topic carries exactly one payload type.

use crate::build::{BuildRecord, TriggerReason};
use crate::error::ErrorKind;
use crate::fact::Fact;
use crate::types::{NodeId, RemediationAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    GraphChange,
    BuildTrigger,
    BuildStatus,
    Fact,
    Remediation,
    Fault,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::GraphChange,
        Topic::BuildTrigger,
        Topic::BuildStatus,
        Topic::Fact,
        Topic::Remediation,
        Topic::Fault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphChange => "graph_change",
            Self::BuildTrigger => "build_trigger",
            Self::BuildStatus => "build_status",
            Self::Fact => "fact",
            Self::Remediation => "remediation",
            Self::Fault => "fault",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry diff published after every successful commit.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphChange {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub edited: Vec<NodeId>,
    pub graph_version: u64,
}

impl GraphChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.edited.is_empty()
    }

    /// Nodes whose builds must be reconsidered.
    pub fn changed(&self) -> impl Iterator<Item = &NodeId> {
        self.added.iter().chain(self.edited.iter())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildTrigger {
    pub node_id: NodeId,
    pub trigger_id: String,
    pub reason: TriggerReason,
}

impl BuildTrigger {
    pub fn manual(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            trigger_id: uuid::Uuid::new_v4().to_string(),
            reason: TriggerReason::Manual,
        }
    }
}

/// A build record transition. `state` is present once a build has succeeded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BuildUpdate {
    pub record: BuildRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationEvent {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub action: RemediationAction,
    pub rule_id: String,
    pub attempt_number: u32,
}

/// Orchestration fault that could not be handled locally.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fault {
    pub node_id: NodeId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    GraphChange(GraphChange),
    BuildTrigger(BuildTrigger),
    BuildStatus(BuildUpdate),
    Fact(Fact),
    Remediation(RemediationEvent),
    Fault(Fault),
}

impl Payload {
    pub fn topic(&self) -> Topic {
        match self {
            Self::GraphChange(_) => Topic::GraphChange,
            Self::BuildTrigger(_) => Topic::BuildTrigger,
            Self::BuildStatus(_) => Topic::BuildStatus,
            Self::Fact(_) => Topic::Fact,
            Self::Remediation(_) => Topic::Remediation,
            Self::Fault(_) => Topic::Fault,
        }
    }

    /// Partition key. Graph changes have no node and share one global partition.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::GraphChange(_) => None,
            Self::BuildTrigger(t) => Some(&t.node_id),
            Self::BuildStatus(u) => Some(&u.record.node_id),
            Self::Fact(f) => Some(&f.node_id),
            Self::Remediation(r) => Some(&r.node_id),
            Self::Fault(f) => Some(&f.node_id),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub topic: Topic,
    pub payload: Payload,
    /// The event, fact or commit that caused this one.
    pub causal_id: String,
    /// Monotonic per (topic, partition); assigned by the bus.
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: Payload, causal_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: payload.topic(),
            payload,
            causal_id: causal_id.into(),
            sequence: 0,
            published_at: Utc::now(),
        }
    }

    pub fn partition(&self) -> Option<&NodeId> {
        self.payload.node_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_follows_payload() {
        let ev = Event::new(
            Payload::BuildTrigger(BuildTrigger::manual("a")),
            "cli",
        );
        assert_eq!(ev.topic, Topic::BuildTrigger);
        assert_eq!(ev.partition(), Some(&NodeId::from("a")));

        let ev = Event::new(Payload::GraphChange(GraphChange::default()), "commit-1");
        assert_eq!(ev.topic, Topic::GraphChange);
        assert!(ev.partition().is_none());
    }

    #[test]
    fn remediation_wire_shape() {
        let ev = RemediationEvent {
            node_id: "a".into(),
            action: RemediationAction::Escalate {
                reason: "max attempts".into(),
            },
            rule_id: "r1".into(),
            attempt_number: 3,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["action"], "escalate");
        assert_eq!(json["reason"], "max attempts");
        assert_eq!(json["node_id"], "a");
    }
}

//! Certified facts: immutable, signed, hash-linked claims about a build's outcome.

use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prior-hash value carried by the first fact in a node's ledger.
pub const GENESIS_HASH: &str = "genesis";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredicateResult {
    pub invariant: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Certified,
    Rejected,
}

impl std::fmt::Display for FactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Certified => write!(f, "certified"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fact {
    pub node_id: NodeId,
    pub build_id: String,
    pub predicate_results: Vec<PredicateResult>,
    pub status: FactStatus,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub prior_hash: String,
    pub signature: String,
    pub hash: String,
}

impl Fact {
    pub fn is_certified(&self) -> bool {
        self.status == FactStatus::Certified
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn failed_invariants(&self) -> Vec<String> {
        self.predicate_results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.invariant.clone())
            .collect()
    }
}

/// Canonical signing input. Field order is fixed by declaration order.
#[derive(Serialize)]
pub struct CanonicalFact<'a> {
    pub node_id: &'a NodeId,
    pub build_id: &'a str,
    pub predicate_results: &'a [PredicateResult],
    pub issued_at: &'a DateTime<Utc>,
    pub prior_hash: &'a str,
}

impl<'a> CanonicalFact<'a> {
    pub fn of(fact: &'a Fact) -> Self {
        Self {
            node_id: &fact.node_id,
            build_id: &fact.build_id,
            predicate_results: &fact.predicate_results,
            issued_at: &fact.issued_at,
            prior_hash: &fact.prior_hash,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

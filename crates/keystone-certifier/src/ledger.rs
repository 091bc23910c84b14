//! Per-node fact ledger, append-only and hash-linked.

use crate::signer::FactSigner;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keystone_core::{
    CanonicalFact, Error, Fact, FactStatus, NodeId, PredicateResult, Result, StateStore,
    GENESIS_HASH,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct FactLedger {
    store: Arc<dyn StateStore>,
    signer: Arc<FactSigner>,
    chains: DashMap<NodeId, Vec<Fact>>,
    /// Serializes appends so each fact links to its true predecessor.
    append: tokio::sync::Mutex<()>,
}

impl FactLedger {
    /// Load every persisted ledger and verify its chain. A broken chain aborts.
    pub async fn open(store: Arc<dyn StateStore>, signer: Arc<FactSigner>) -> Result<Self> {
        let ledger = Self {
            store,
            signer,
            chains: DashMap::new(),
            append: tokio::sync::Mutex::new(()),
        };
        let loaded = ledger.store.load_ledgers().await?;
        let mut total = 0;
        for (node, facts) in loaded {
            total += facts.len();
            ledger.chains.insert(node.clone(), facts);
            ledger.verify(&node)?;
        }
        info!(nodes = ledger.chains.len(), facts = total, "fact ledgers verified");
        Ok(ledger)
    }

    /// Sign, link and persist a new fact for the node.
    pub async fn issue(
        &self,
        node: &NodeId,
        build_id: &str,
        predicate_results: Vec<PredicateResult>,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Fact> {
        let _append = self.append.lock().await;
        let prior_hash = self
            .last(node)
            .map(|f| f.hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let status = if predicate_results.iter().all(|r| r.passed) {
            FactStatus::Certified
        } else {
            FactStatus::Rejected
        };

        let mut fact = Fact {
            node_id: node.clone(),
            build_id: build_id.to_string(),
            predicate_results,
            status,
            issued_at,
            expires_at,
            prior_hash,
            signature: String::new(),
            hash: String::new(),
        };
        let canonical = CanonicalFact::of(&fact).to_bytes()?;
        fact.signature = self.signer.sign(&canonical);
        fact.hash = FactSigner::chain_hash(&canonical, &fact.signature);

        self.store.append_fact(&fact).await?;
        self.chains
            .entry(node.clone())
            .or_default()
            .push(fact.clone());
        Ok(fact)
    }

    pub fn facts(&self, node: &NodeId) -> Vec<Fact> {
        self.chains
            .get(node)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn last(&self, node: &NodeId) -> Option<Fact> {
        self.chains.get(node).and_then(|c| c.last().cloned())
    }

    pub fn contains_build(&self, node: &NodeId, build_id: &str) -> bool {
        self.chains
            .get(node)
            .is_some_and(|c| c.iter().any(|f| f.build_id == build_id))
    }

    pub fn count_by_status(&self) -> BTreeMap<FactStatus, usize> {
        let mut counts = BTreeMap::new();
        for chain in self.chains.iter() {
            for fact in chain.value() {
                *counts.entry(fact.status).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Recompute every link, signature and hash of the node's chain.
    pub fn verify(&self, node: &NodeId) -> Result<()> {
        let facts = self.facts(node);
        let mut expected_prior = GENESIS_HASH.to_string();
        for (position, fact) in facts.iter().enumerate() {
            let broken = |reason: &str| {
                warn!(node = %node, position, reason, "fact ledger broken");
                Error::LedgerTampered {
                    node: node.clone(),
                    position,
                    reason: reason.to_string(),
                }
            };
            if &fact.node_id != node {
                return Err(broken("fact belongs to another node"));
            }
            if fact.prior_hash != expected_prior {
                return Err(broken("prior hash does not match predecessor"));
            }
            let canonical = CanonicalFact::of(fact).to_bytes()?;
            if !self.signer.verify(&canonical, &fact.signature) {
                return Err(broken("signature mismatch"));
            }
            if FactSigner::chain_hash(&canonical, &fact.signature) != fact.hash {
                return Err(broken("hash mismatch"));
            }
            let all_passed = fact.predicate_results.iter().all(|r| r.passed);
            if all_passed != fact.is_certified() {
                return Err(broken("status disagrees with predicate results"));
            }
            expected_prior = fact.hash.clone();
        }
        Ok(())
    }

    pub fn verify_all(&self) -> Result<()> {
        let nodes: Vec<NodeId> = self.chains.iter().map(|e| e.key().clone()).collect();
        for node in nodes {
            self.verify(&node)?;
        }
        Ok(())
    }
}

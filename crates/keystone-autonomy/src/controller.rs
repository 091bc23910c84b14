//! AutonomyController — evaluates guardrails against each node's fact window
//! and emits bounded remediation events.

use crate::audit::{AuditEntry, AuditTrail};
use crate::condition::holds;
use crate::governor::Governor;
use keystone_bus::{EventBus, IdempotencyGuard, Subscriber};
use keystone_core::config::AutonomyConfig;
use keystone_core::{
    ActionKind, Event, Fact, GraphChange, GuardrailRule, NodeId, Payload, RemediationAction,
    RemediationEvent, Result,
};
use keystone_registry::Registry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const AUDIT_CAPACITY: usize = 1024;

#[derive(Default)]
struct NodeState {
    window: VecDeque<Fact>,
    /// Firings per rule id since the node last certified or was edited.
    attempts: HashMap<String, u32>,
}

struct State {
    nodes: HashMap<NodeId, NodeState>,
    governor: Governor,
}

pub struct AutonomyController {
    window_size: usize,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    state: Mutex<State>,
    seen: IdempotencyGuard,
    audit: AuditTrail,
}

impl AutonomyController {
    pub fn new(config: &AutonomyConfig, registry: Arc<Registry>, bus: Arc<EventBus>) -> Self {
        Self {
            window_size: config.fact_window.max(1),
            registry,
            bus,
            state: Mutex::new(State {
                nodes: HashMap::new(),
                governor: Governor::new(config),
            }),
            seen: IdempotencyGuard::new(4096),
            audit: AuditTrail::new(AUDIT_CAPACITY),
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Firings of `rule` on `node` in the current attempt generation.
    pub async fn attempts(&self, node: &NodeId, rule: &str) -> u32 {
        self.state
            .lock()
            .await
            .nodes
            .get(node)
            .and_then(|n| n.attempts.get(rule).copied())
            .unwrap_or(0)
    }

    /// Rules from every manifest whose scope covers `node`, first declaration wins.
    fn rules_for(&self, node: &NodeId) -> Vec<GuardrailRule> {
        let snapshot = self.registry.snapshot();
        let mut rules: Vec<GuardrailRule> = Vec::new();
        // The node's own manifest first, then the rest in id order.
        let own = snapshot.get(node).cloned();
        let others = snapshot.manifests().filter(|m| &m.id != node).cloned();
        for manifest in own.into_iter().chain(others) {
            for rule in &manifest.guardrails {
                if rule.scope.matches(node) && !rules.iter().any(|r| r.id == rule.id) {
                    rules.push(rule.clone());
                }
            }
        }
        rules
    }

    /// Record the fact and compute the remediations it fires. Caller publishes.
    async fn evaluate(&self, fact: &Fact) -> Vec<(Event, AuditEntry)> {
        let rules = self.rules_for(&fact.node_id);
        let now = chrono::Utc::now();
        let mut state = self.state.lock().await;
        let State { nodes, governor } = &mut *state;

        governor.observe(&fact.node_id, fact.is_certified());
        let node = nodes.entry(fact.node_id.clone()).or_default();
        node.window.push_back(fact.clone());
        node.window.retain(|f| !f.is_expired(now));
        while node.window.len() > self.window_size {
            node.window.pop_front();
        }
        if fact.is_certified() {
            node.attempts.clear();
        }

        let window: Vec<Fact> = node.window.iter().cloned().collect();
        let mut out = Vec::new();
        for rule in rules {
            if !holds(&rule.condition, &window) {
                continue;
            }
            let attempt = node.attempts.entry(rule.id.clone()).or_insert(0);
            *attempt += 1;
            let attempt_number = *attempt;

            let action = if attempt_number > rule.max_attempts {
                RemediationAction::Escalate {
                    reason: format!(
                        "rule '{}' exhausted {} attempts",
                        rule.id, rule.max_attempts
                    ),
                }
            } else {
                match rule.action {
                    ActionKind::Escalate => RemediationAction::Escalate {
                        reason: format!("rule '{}' requested escalation", rule.id),
                    },
                    kind => {
                        let clock = Instant::now();
                        match governor.check(&fact.node_id, clock) {
                            Ok(()) => {
                                governor.record(&fact.node_id, clock);
                                if kind == ActionKind::RetryBuild {
                                    RemediationAction::RetryBuild
                                } else {
                                    RemediationAction::RollbackNode
                                }
                            }
                            Err(reason) => {
                                warn!(node = %fact.node_id, rule = %rule.id, %reason, "governor degraded action to escalate");
                                RemediationAction::Escalate { reason }
                            }
                        }
                    }
                }
            };

            let remediation = RemediationEvent {
                node_id: fact.node_id.clone(),
                action: action.clone(),
                rule_id: rule.id.clone(),
                attempt_number,
            };
            let event = Event::new(Payload::Remediation(remediation), fact.hash.clone());
            let entry = AuditEntry {
                at: now,
                node_id: fact.node_id.clone(),
                rule_id: rule.id.clone(),
                action,
                attempt_number,
                fact_hash: fact.hash.clone(),
                event_id: event.id.clone(),
            };
            out.push((event, entry));
        }
        out
    }

    async fn on_fact(&self, fact: &Fact) {
        if !self.seen.first_seen(&fact.hash) {
            debug!(hash = %fact.hash, "fact already evaluated");
            return;
        }
        for (event, entry) in self.evaluate(fact).await {
            info!(
                node = %entry.node_id,
                rule = %entry.rule_id,
                action = %entry.action.kind(),
                attempt = entry.attempt_number,
                "remediation emitted"
            );
            self.audit.push(entry);
            if let Err(e) = self.bus.publish(event).await {
                warn!(error = %e, "remediation delivery failed");
            }
        }
    }

    async fn on_graph_change(&self, change: &GraphChange) {
        let mut state = self.state.lock().await;
        for id in &change.edited {
            if let Some(node) = state.nodes.get_mut(id) {
                node.attempts.clear();
                node.window.clear();
            }
        }
        for id in &change.removed {
            state.nodes.remove(id);
            state.governor.forget(id);
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for AutonomyController {
    fn name(&self) -> &str {
        "autonomy"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match &event.payload {
            Payload::Fact(fact) => self.on_fact(fact).await,
            Payload::GraphChange(change) => self.on_graph_change(change).await,
            _ => {}
        }
        Ok(())
    }
}

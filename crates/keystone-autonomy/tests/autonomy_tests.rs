//! Tests for keystone-autonomy: guardrail firing, attempt limits, governor degradation

use keystone_autonomy::AutonomyController;
use keystone_bus::{EventBus, Recorder, Subscriber};
use keystone_core::config::{AutonomyConfig, BusConfig};
use keystone_core::*;
use keystone_registry::Registry;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    controller: Arc<AutonomyController>,
    remediations: Arc<Recorder>,
}

async fn harness(config: AutonomyConfig) -> Harness {
    let bus = Arc::new(EventBus::new(&BusConfig::default()));
    let remediations = Arc::new(Recorder::new("remediations"));
    bus.subscribe(Topic::Remediation, remediations.clone()).await;
    let registry = Arc::new(
        Registry::open(Arc::new(MemoryStore::new()), bus.clone())
            .await
            .unwrap(),
    );
    let controller = Arc::new(AutonomyController::new(&config, registry.clone(), bus.clone()));
    Harness {
        registry,
        bus,
        controller,
        remediations,
    }
}

fn retry_on_reject(max_attempts: u32) -> GuardrailRule {
    GuardrailRule::new(
        "retry-on-reject",
        Scope::Any,
        Condition::LastRejected,
        ActionKind::RetryBuild,
        max_attempts,
    )
}

fn fact(node: &str, n: usize, certified: bool) -> Fact {
    Fact {
        node_id: node.into(),
        build_id: format!("{node}-build-{n}"),
        predicate_results: vec![PredicateResult {
            invariant: "healthy".into(),
            passed: certified,
            detail: None,
        }],
        status: if certified {
            FactStatus::Certified
        } else {
            FactStatus::Rejected
        },
        issued_at: chrono::Utc::now(),
        expires_at: None,
        prior_hash: GENESIS_HASH.into(),
        signature: "sig".into(),
        hash: format!("{node}-hash-{n}"),
    }
}

async fn deliver(h: &Harness, fact: Fact) {
    h.controller
        .handle(&Event::new(Payload::Fact(fact), "test"))
        .await
        .unwrap();
}

fn actions(h: &Harness) -> Vec<RemediationEvent> {
    h.remediations
        .on_topic(Topic::Remediation)
        .into_iter()
        .filter_map(|e| match e.payload {
            Payload::Remediation(r) => Some(r),
            _ => None,
        })
        .collect()
}

// ===========================================================================
// Firing and attempt limits
// ===========================================================================

#[tokio::test]
async fn rejected_fact_fires_matching_rule() {
    let h = harness(AutonomyConfig::default()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(2)))
        .await
        .unwrap();

    deliver(&h, fact("a", 1, true)).await;
    assert!(actions(&h).is_empty());

    deliver(&h, fact("a", 2, false)).await;
    let fired = actions(&h);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].action, RemediationAction::RetryBuild);
    assert_eq!(fired[0].attempt_number, 1);

    let events = h.remediations.on_topic(Topic::Remediation);
    assert_eq!(events[0].causal_id, "a-hash-2");
    let audit = h.controller.audit().for_node(&"a".into());
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].event_id, events[0].id);
}

#[tokio::test]
async fn exhausted_rule_degrades_to_escalate() {
    let h = harness(AutonomyConfig::default()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(2)))
        .await
        .unwrap();

    for n in 1..=4 {
        deliver(&h, fact("a", n, false)).await;
    }
    let kinds: Vec<ActionKind> = actions(&h).iter().map(|r| r.action.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ActionKind::RetryBuild,
            ActionKind::RetryBuild,
            ActionKind::Escalate,
            ActionKind::Escalate
        ]
    );
    assert_eq!(h.controller.attempts(&"a".into(), "retry-on-reject").await, 4);
}

#[tokio::test]
async fn certification_resets_attempts() {
    let h = harness(AutonomyConfig::default()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(1)))
        .await
        .unwrap();

    deliver(&h, fact("a", 1, false)).await;
    deliver(&h, fact("a", 2, true)).await;
    deliver(&h, fact("a", 3, false)).await;

    let fired = actions(&h);
    assert_eq!(fired.len(), 2);
    assert!(fired.iter().all(|r| r.action == RemediationAction::RetryBuild));
    assert_eq!(fired[1].attempt_number, 1);
}

#[tokio::test]
async fn redelivered_fact_is_evaluated_once() {
    let h = harness(AutonomyConfig::default()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(5)))
        .await
        .unwrap();

    let f = fact("a", 1, false);
    deliver(&h, f.clone()).await;
    deliver(&h, f).await;
    assert_eq!(actions(&h).len(), 1);
}

#[tokio::test]
async fn scope_limits_which_nodes_fire() {
    let h = harness(AutonomyConfig::default()).await;
    let rule = GuardrailRule::new(
        "watch-b",
        Scope::Node("b".into()),
        Condition::LastRejected,
        ActionKind::RollbackNode,
        3,
    );
    h.registry
        .register_all(vec![
            Manifest::new("a", 1).with_guardrail(rule),
            Manifest::new("b", 1),
        ])
        .await
        .unwrap();

    deliver(&h, fact("a", 1, false)).await;
    assert!(actions(&h).is_empty());

    deliver(&h, fact("b", 1, false)).await;
    let fired = actions(&h);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].node_id, NodeId::from("b"));
    assert_eq!(fired[0].action, RemediationAction::RollbackNode);
}

#[tokio::test]
async fn expired_facts_leave_the_window() {
    let h = harness(AutonomyConfig::default()).await;
    let rule = GuardrailRule::new(
        "two-strikes",
        Scope::Any,
        Condition::ConsecutiveRejections { count: 2 },
        ActionKind::RetryBuild,
        3,
    );
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(rule))
        .await
        .unwrap();

    let mut stale = fact("a", 1, false);
    stale.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    deliver(&h, stale).await;
    deliver(&h, fact("a", 2, false)).await;
    assert!(actions(&h).is_empty());

    deliver(&h, fact("a", 3, false)).await;
    assert_eq!(actions(&h).len(), 1);
}

#[tokio::test]
async fn edited_manifest_starts_fresh_attempts() {
    let h = harness(AutonomyConfig::default()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(1)))
        .await
        .unwrap();
    deliver(&h, fact("a", 1, false)).await;
    assert_eq!(h.controller.attempts(&"a".into(), "retry-on-reject").await, 1);

    let change = h
        .registry
        .register(Manifest::new("a", 2).with_guardrail(retry_on_reject(1)))
        .await
        .unwrap();
    h.controller
        .handle(&Event::new(Payload::GraphChange(change), "graph-v2"))
        .await
        .unwrap();
    assert_eq!(h.controller.attempts(&"a".into(), "retry-on-reject").await, 0);

    deliver(&h, fact("a", 2, false)).await;
    assert_eq!(actions(&h)[1].action, RemediationAction::RetryBuild);
}

// ===========================================================================
// Governor
// ===========================================================================

#[tokio::test]
async fn hourly_budget_degrades_to_escalate() {
    let h = harness(AutonomyConfig {
        max_actions_per_hour: 1,
        ..Default::default()
    })
    .await;
    h.registry
        .register_all(vec![
            Manifest::new("a", 1).with_guardrail(retry_on_reject(5)),
            Manifest::new("b", 1),
        ])
        .await
        .unwrap();

    deliver(&h, fact("a", 1, false)).await;
    deliver(&h, fact("b", 1, false)).await;

    let fired = actions(&h);
    assert_eq!(fired[0].action, RemediationAction::RetryBuild);
    match &fired[1].action {
        RemediationAction::Escalate { reason } => assert!(reason.contains("budget")),
        other => panic!("expected escalate, got {other:?}"),
    }
}

#[tokio::test]
async fn breaker_trips_on_rejection_streak() {
    let h = harness(AutonomyConfig {
        fail_streak_trip: 2,
        ..Default::default()
    })
    .await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(10)))
        .await
        .unwrap();

    deliver(&h, fact("a", 1, false)).await;
    deliver(&h, fact("a", 2, false)).await;

    let fired = actions(&h);
    assert_eq!(fired[0].action, RemediationAction::RetryBuild);
    assert_eq!(fired[1].action.kind(), ActionKind::Escalate);
}

// ===========================================================================
// Bus wiring
// ===========================================================================

#[tokio::test]
async fn facts_published_on_the_bus_reach_the_controller() {
    let h = harness(AutonomyConfig::default()).await;
    h.bus.subscribe(Topic::Fact, h.controller.clone()).await;
    h.registry
        .register(Manifest::new("a", 1).with_guardrail(retry_on_reject(2)))
        .await
        .unwrap();

    h.bus
        .publish(Event::new(Payload::Fact(fact("a", 1, false)), "build-1"))
        .await
        .unwrap();
    assert!(
        h.remediations
            .wait_for(Duration::from_secs(2), |events| !events.is_empty())
            .await
    );
}

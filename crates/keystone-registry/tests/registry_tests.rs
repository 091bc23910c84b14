//! Tests for keystone-registry: atomic commits, cycle rejection, status tracking

use keystone_bus::{EventBus, Recorder, Subscriber};
use keystone_core::config::BusConfig;
use keystone_core::*;
use keystone_registry::*;
use std::sync::Arc;

async fn open() -> (Arc<Registry>, Arc<EventBus>, Arc<Recorder>) {
    let bus = Arc::new(EventBus::new(&BusConfig::default()));
    let recorder = Arc::new(Recorder::new("graph"));
    bus.subscribe(Topic::GraphChange, recorder.clone()).await;
    let registry = Registry::open(Arc::new(MemoryStore::new()), bus.clone())
        .await
        .unwrap();
    (Arc::new(registry), bus, recorder)
}

// ===========================================================================
// Registration
// ===========================================================================

#[tokio::test]
async fn register_announces_added_then_edited() {
    let (registry, _bus, recorder) = open().await;

    let first = registry.register(Manifest::new("db", 1)).await.unwrap();
    assert_eq!(first.added, vec![NodeId::from("db")]);
    assert_eq!(first.graph_version, 1);

    let second = registry.register(Manifest::new("db", 2)).await.unwrap();
    assert_eq!(second.edited, vec![NodeId::from("db")]);
    assert_eq!(second.graph_version, 2);

    let events = recorder.on_topic(Topic::GraphChange);
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].causal_id, "graph-v2");
    assert_eq!(registry.get(&"db".into()).unwrap().manifest.version, 2);
}

#[tokio::test]
async fn stale_version_is_rejected() {
    let (registry, _bus, _) = open().await;
    registry.register(Manifest::new("db", 3)).await.unwrap();

    let err = registry.register(Manifest::new("db", 3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(registry.snapshot().version, 1);
}

#[tokio::test]
async fn unknown_dependency_is_rejected() {
    let (registry, _bus, recorder) = open().await;
    let err = registry
        .register(Manifest::new("api", 1).depends_on("db"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(registry.snapshot().is_empty());
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn cycle_leaves_snapshot_untouched() {
    let (registry, _bus, _) = open().await;
    registry
        .register_all(vec![Manifest::new("a", 1), Manifest::new("b", 1).depends_on("a")])
        .await
        .unwrap();
    let before = registry.snapshot();

    let err = registry
        .register(Manifest::new("a", 2).depends_on("b"))
        .await
        .unwrap_err();
    match err {
        Error::Cycle { cycle } => {
            assert_eq!(cycle.first(), cycle.last());
            assert!(cycle.contains(&NodeId::from("b")));
        }
        other => panic!("expected cycle, got {other}"),
    }

    let after = registry.snapshot();
    assert_eq!(after.version, before.version);
    assert_eq!(after.get(&"a".into()).unwrap().version, 1);
}

#[tokio::test]
async fn batch_registration_is_all_or_nothing() {
    let (registry, _bus, _) = open().await;
    let err = registry
        .register_all(vec![
            Manifest::new("a", 1),
            Manifest::new("b", 1).depends_on("missing"),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(registry.get(&"a".into()).is_err());
}

#[tokio::test]
async fn snapshots_are_immutable_views() {
    let (registry, _bus, _) = open().await;
    registry.register(Manifest::new("a", 1)).await.unwrap();
    let held = registry.snapshot();
    registry.register(Manifest::new("b", 1).depends_on("a")).await.unwrap();

    assert_eq!(held.len(), 1);
    assert_eq!(registry.snapshot().len(), 2);
    assert_eq!(
        registry.dependents_of(&"a".into()).unwrap(),
        vec![NodeId::from("b")]
    );
}

// ===========================================================================
// Removal
// ===========================================================================

#[tokio::test]
async fn remove_refuses_while_depended_on() {
    let (registry, _bus, _) = open().await;
    registry
        .register_all(vec![Manifest::new("a", 1), Manifest::new("b", 1).depends_on("a")])
        .await
        .unwrap();

    assert!(registry.remove(&"a".into()).await.is_err());
    let change = registry.remove(&"b".into()).await.unwrap();
    assert_eq!(change.removed, vec![NodeId::from("b")]);
    registry.remove(&"a".into()).await.unwrap();
    assert!(registry.snapshot().is_empty());

    let missing = registry.remove(&"a".into()).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reopen_restores_persisted_manifests() {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(EventBus::new(&BusConfig::default()));
    {
        let registry = Registry::open(Arc::new(FsStore::new(dir.path())), bus.clone())
            .await
            .unwrap();
        registry
            .register_all(vec![Manifest::new("a", 4), Manifest::new("b", 1).depends_on("a")])
            .await
            .unwrap();
    }

    let registry = Registry::open(Arc::new(FsStore::new(dir.path())), bus)
        .await
        .unwrap();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get(&"a".into()).unwrap().version, 4);
    assert_eq!(
        snapshot.graph().topological_order(),
        &[NodeId::from("a"), NodeId::from("b")]
    );
}

// ===========================================================================
// Status tracking
// ===========================================================================

fn build_event(node: &str, build_id: &str, status: BuildStatus) -> Event {
    let mut record = BuildRecord::new(&node.into(), "t", 1, TriggerReason::Manual, 1);
    record.build_id = build_id.to_string();
    record.status = status;
    Event::new(Payload::BuildStatus(BuildUpdate { record, state: None }), "t")
}

fn fact_event(node: &str, build_id: &str, status: FactStatus) -> Event {
    Event::new(
        Payload::Fact(Fact {
            node_id: node.into(),
            build_id: build_id.to_string(),
            predicate_results: vec![],
            status,
            issued_at: chrono::Utc::now(),
            expires_at: None,
            prior_hash: GENESIS_HASH.to_string(),
            signature: String::new(),
            hash: String::new(),
        }),
        "t",
    )
}

#[tokio::test]
async fn certification_outranks_late_build_report() {
    let (registry, _bus, _) = open().await;
    registry.register(Manifest::new("a", 1)).await.unwrap();
    let tracker = StatusTracker::new(registry.clone());
    let a = NodeId::from("a");

    assert_eq!(registry.status(&a), Some(NodeStatus::Registered));
    tracker.handle(&build_event("a", "b1", BuildStatus::Running)).await.unwrap();
    assert_eq!(registry.status(&a), Some(NodeStatus::Running));

    tracker.handle(&fact_event("a", "b1", FactStatus::Certified)).await.unwrap();
    tracker.handle(&build_event("a", "b1", BuildStatus::Succeeded)).await.unwrap();
    assert_eq!(registry.status(&a), Some(NodeStatus::Certified));

    tracker.handle(&build_event("a", "b2", BuildStatus::Pending)).await.unwrap();
    assert_eq!(registry.status(&a), Some(NodeStatus::Pending));
}

#[tokio::test]
async fn tracker_follows_bus_events() {
    let (registry, bus, _) = open().await;
    registry.register(Manifest::new("a", 1)).await.unwrap();
    let tracker = Arc::new(StatusTracker::new(registry.clone()));
    bus.subscribe(Topic::BuildStatus, tracker.clone()).await;
    bus.subscribe(Topic::Fact, tracker).await;

    bus.publish(build_event("a", "b1", BuildStatus::Blocked)).await.unwrap();
    assert_eq!(registry.get(&"a".into()).unwrap().status, NodeStatus::Blocked);

    // Unknown nodes are ignored rather than resurrected.
    bus.publish(build_event("ghost", "b9", BuildStatus::Running)).await.unwrap();
    assert_eq!(registry.status(&"ghost".into()), None);
}

#[tokio::test]
async fn restore_seeds_status_from_history() {
    let (registry, _bus, _) = open().await;
    registry
        .register_all(vec![Manifest::new("a", 1), Manifest::new("b", 1)])
        .await
        .unwrap();
    let tracker = StatusTracker::new(registry.clone());

    let record = |id: &str, build: &str, status: BuildStatus| match build_event(id, build, status).payload {
        Payload::BuildStatus(update) => update.record,
        _ => unreachable!(),
    };
    let fact = |id: &str, build: &str| match fact_event(id, build, FactStatus::Certified).payload {
        Payload::Fact(f) => f,
        _ => unreachable!(),
    };

    // Certified build is the latest: the fact wins.
    tracker.restore(
        &"a".into(),
        &[record("a", "a1", BuildStatus::Succeeded)],
        Some(&fact("a", "a1")),
    );
    assert_eq!(registry.status(&"a".into()), Some(NodeStatus::Certified));

    // A later rollback outranks the fact of an older build.
    tracker.restore(
        &"b".into(),
        &[
            record("b", "b1", BuildStatus::Succeeded),
            record("b", "b2", BuildStatus::RolledBack),
            record("b", "b3", BuildStatus::Superseded),
        ],
        Some(&fact("b", "b1")),
    );
    assert_eq!(registry.status(&"b".into()), Some(NodeStatus::RolledBack));
}

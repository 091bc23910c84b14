//! Tests for keystone-bus: ordering, sequencing, critical vs advisory delivery, replay

use keystone_bus::*;
use keystone_core::config::{BusConfig, TopicConfig};
use keystone_core::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn trigger(node: &str) -> Event {
    Event::new(Payload::BuildTrigger(BuildTrigger::manual(node)), "test")
}

fn fault(node: &str) -> Event {
    Event::new(
        Payload::Fault(Fault {
            node_id: node.into(),
            kind: ErrorKind::Internal,
            message: "x".into(),
        }),
        "test",
    )
}

/// Fails the first `failures` deliveries, then succeeds.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl Subscriber for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn handle(&self, _event: &Event) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(Error::Internal("transient".into()))
        } else {
            Ok(())
        }
    }
}

struct Slow;

#[async_trait::async_trait]
impl Subscriber for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn handle(&self, _event: &Event) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

fn fast_config() -> BusConfig {
    BusConfig {
        default_timeout_ms: 50,
        advisory_backoff_ms: 1,
        advisory_max_retries: 2,
        ..Default::default()
    }
}

// ===========================================================================
// Sequencing and ordering
// ===========================================================================

#[tokio::test]
async fn sequences_are_per_partition() {
    let bus = EventBus::new(&BusConfig::default());
    let a1 = bus.publish(trigger("a")).await.unwrap();
    let b1 = bus.publish(trigger("b")).await.unwrap();
    let a2 = bus.publish(trigger("a")).await.unwrap();
    assert_eq!(a1.sequence, 1);
    assert_eq!(b1.sequence, 1);
    assert_eq!(a2.sequence, 2);
}

#[tokio::test]
async fn subscriber_sees_publish_order_per_node() {
    let bus = EventBus::new(&BusConfig::default());
    let rec = Arc::new(Recorder::new("rec"));
    bus.subscribe(Topic::BuildTrigger, rec.clone()).await;

    for _ in 0..20 {
        bus.publish(trigger("a")).await.unwrap();
        bus.publish(trigger("b")).await.unwrap();
    }

    let events = rec.events();
    assert_eq!(events.len(), 40);
    for node in ["a", "b"] {
        let seqs: Vec<u64> = events
            .iter()
            .filter(|e| e.partition() == Some(&NodeId::from(node)))
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn topics_are_isolated() {
    let bus = EventBus::new(&BusConfig::default());
    let rec = Arc::new(Recorder::new("rec"));
    bus.subscribe(Topic::Fact, rec.clone()).await;
    bus.publish(trigger("a")).await.unwrap();
    assert!(rec.events().is_empty());
}

// ===========================================================================
// Critical topics
// ===========================================================================

#[tokio::test]
async fn critical_publish_waits_for_handler() {
    let bus = EventBus::new(&BusConfig::default());
    let rec = Arc::new(Recorder::new("rec"));
    bus.subscribe(Topic::BuildTrigger, rec.clone()).await;
    bus.publish(trigger("a")).await.unwrap();
    // handled before publish returned
    assert_eq!(rec.events().len(), 1);
}

#[tokio::test]
async fn critical_failure_surfaces_to_publisher() {
    let bus = EventBus::new(&fast_config());
    bus.subscribe(
        Topic::BuildTrigger,
        Arc::new(Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        }),
    )
    .await;

    let err = bus.publish(trigger("a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeliveryFailure);
    // redelivery by the publisher succeeds
    bus.publish(trigger("a")).await.unwrap();
}

#[tokio::test]
async fn critical_timeout_is_delivery_failure() {
    let bus = EventBus::new(&fast_config());
    bus.subscribe(Topic::Fact, Arc::new(Slow)).await;
    let fact = Fact {
        node_id: "a".into(),
        build_id: "b".into(),
        predicate_results: vec![],
        status: FactStatus::Certified,
        issued_at: chrono::Utc::now(),
        expires_at: None,
        prior_hash: GENESIS_HASH.into(),
        signature: String::new(),
        hash: String::new(),
    };
    let err = bus
        .publish(Event::new(Payload::Fact(fact), "t"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeded"));
}

// ===========================================================================
// Advisory topics
// ===========================================================================

#[tokio::test]
async fn advisory_retries_then_succeeds() {
    let bus = EventBus::new(&fast_config());
    let flaky = Arc::new(Flaky {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    bus.subscribe(Topic::Fault, flaky.clone()).await;

    bus.publish(fault("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(bus.dead_letters().is_empty());
}

#[tokio::test]
async fn advisory_exhaustion_dead_letters() {
    let bus = EventBus::new(&fast_config());
    bus.subscribe(
        Topic::Fault,
        Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        }),
    )
    .await;

    // advisory publish never fails the caller
    bus.publish(fault("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let letters = bus.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].subscriber, "flaky");
}

#[tokio::test]
async fn topic_override_makes_topic_advisory() {
    let mut cfg = fast_config();
    cfg.topics.insert(
        "build_trigger".into(),
        TopicConfig {
            critical: false,
            timeout_ms: None,
        },
    );
    let bus = EventBus::new(&cfg);
    assert!(!bus.policy(Topic::BuildTrigger).critical);
    bus.subscribe(
        Topic::BuildTrigger,
        Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        }),
    )
    .await;
    assert!(bus.publish(trigger("a")).await.is_ok());
}

// ===========================================================================
// Replay window
// ===========================================================================

#[tokio::test]
async fn replay_window_is_bounded() {
    let bus = EventBus::new(&BusConfig {
        replay_window: 3,
        ..Default::default()
    });
    for _ in 0..5 {
        bus.publish(trigger("a")).await.unwrap();
    }
    let window = bus.replay(Topic::BuildTrigger).await;
    assert_eq!(
        window.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![3, 4, 5]
    );
    let tail = bus
        .replay_partition(Topic::BuildTrigger, Some(&"a".into()), 4)
        .await;
    assert_eq!(tail.len(), 1);
    assert_eq!(bus.history().await[&Topic::BuildTrigger], 5);
}

#[tokio::test]
async fn shutdown_fails_pending_critical_delivery() {
    let bus = EventBus::new(&BusConfig::default());
    bus.subscribe(Topic::BuildTrigger, Arc::new(Recorder::new("rec"))).await;
    bus.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let err = bus.publish(trigger("a")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeliveryFailure);
}

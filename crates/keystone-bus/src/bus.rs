//! Event bus — per-topic ordered fan-out with critical/advisory delivery policy.

use crate::subscriber::Subscriber;
use chrono::{DateTime, Utc};
use keystone_core::config::BusConfig;
use keystone_core::{Error, Event, NodeId, Result, Topic};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivery policy for one topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicPolicy {
    /// Critical topics surface failures to the publisher; advisory topics retry then dead-letter.
    pub critical: bool,
    /// Per-delivery handler timeout.
    pub timeout: Duration,
}

/// An advisory delivery that exhausted its retries.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub event: Event,
    pub subscriber: String,
    pub error: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

struct Envelope {
    event: Event,
    ack: Option<oneshot::Sender<Result<()>>>,
}

struct Subscription {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct TopicState {
    /// Next sequence per partition; `None` is the global partition.
    sequences: HashMap<Option<NodeId>, u64>,
    window: VecDeque<Event>,
    subscribers: Vec<Subscription>,
    published: u64,
}

struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
}

pub struct EventBus {
    topics: BTreeMap<Topic, tokio::sync::Mutex<TopicState>>,
    policies: BTreeMap<Topic, TopicPolicy>,
    replay_window: usize,
    retry: Arc<RetryPolicy>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    dead_letter_capacity: usize,
    shutdown: CancellationToken,
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        let policies = Topic::ALL
            .iter()
            .map(|t| {
                let settings = config.topic(*t);
                let timeout = settings.timeout_ms.unwrap_or(config.default_timeout_ms);
                (
                    *t,
                    TopicPolicy {
                        critical: settings.critical,
                        timeout: Duration::from_millis(timeout),
                    },
                )
            })
            .collect();
        let topics = Topic::ALL
            .iter()
            .map(|t| (*t, tokio::sync::Mutex::new(TopicState::default())))
            .collect();

        info!(
            replay_window = config.replay_window,
            "event bus initialized"
        );

        Self {
            topics,
            policies,
            replay_window: config.replay_window.max(1),
            retry: Arc::new(RetryPolicy {
                max_retries: config.advisory_max_retries,
                backoff: Duration::from_millis(config.advisory_backoff_ms),
            }),
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
            dead_letter_capacity: config.dead_letter_capacity.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self, topic: Topic) -> TopicPolicy {
        self.policies[&topic]
    }

    fn state(&self, topic: Topic) -> &tokio::sync::Mutex<TopicState> {
        &self.topics[&topic]
    }

    /// Register a subscriber on a topic. Each subscription gets its own dispatcher
    /// task, so topics are handled concurrently while each subscription sees its
    /// topic's events in publish order.
    pub async fn subscribe(&self, topic: Topic, subscriber: Arc<dyn Subscriber>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = subscriber.name().to_string();
        self.state(topic).lock().await.subscribers.push(Subscription {
            name: name.clone(),
            tx,
        });

        tokio::spawn(dispatch(
            topic,
            self.policy(topic),
            subscriber,
            rx,
            self.retry.clone(),
            self.dead_letters.clone(),
            self.dead_letter_capacity,
            self.shutdown.clone(),
        ));
        debug!(%topic, subscriber = %name, "subscribed");
    }

    /// Publish an event. Returns the event with its assigned sequence once it has been
    /// enqueued for every subscriber and, on critical topics, handled by all of them.
    pub async fn publish(&self, mut event: Event) -> Result<Event> {
        let topic = event.topic;
        let policy = self.policy(topic);

        let mut acks = Vec::new();
        let mut unreachable = Vec::new();
        {
            let mut state = self.state(topic).lock().await;
            let seq = state
                .sequences
                .entry(event.partition().cloned())
                .or_insert(0);
            *seq += 1;
            event.sequence = *seq;
            state.published += 1;

            state.window.push_back(event.clone());
            while state.window.len() > self.replay_window {
                state.window.pop_front();
            }

            for sub in &state.subscribers {
                let (ack_tx, ack_rx) = if policy.critical {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };
                let envelope = Envelope {
                    event: event.clone(),
                    ack: ack_tx,
                };
                if sub.tx.send(envelope).is_err() {
                    unreachable.push(sub.name.clone());
                } else if let Some(rx) = ack_rx {
                    acks.push((sub.name.clone(), rx));
                }
            }
        }

        debug!(%topic, sequence = event.sequence, causal_id = %event.causal_id, "published");

        for name in &unreachable {
            if policy.critical {
                return Err(Error::delivery_failure(
                    topic.as_str(),
                    name,
                    "subscriber is no longer running",
                    true,
                ));
            }
            self.dead_letter(DeadLetter {
                event: event.clone(),
                subscriber: name.clone(),
                error: "subscriber is no longer running".into(),
                attempts: 0,
                at: Utc::now(),
            });
        }

        let mut first_failure = None;
        for (name, rx) in acks {
            let outcome = match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::delivery_failure(
                    topic.as_str(),
                    &name,
                    "dispatcher stopped before acknowledging",
                    true,
                )),
            };
            if let Err(e) = outcome {
                warn!(%topic, subscriber = %name, error = %e, "critical delivery failed");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(event),
        }
    }

    /// Events still inside the topic's replay window, oldest first.
    pub async fn replay(&self, topic: Topic) -> Vec<Event> {
        self.state(topic).lock().await.window.iter().cloned().collect()
    }

    /// Replay one partition after a known sequence.
    pub async fn replay_partition(
        &self,
        topic: Topic,
        node: Option<&NodeId>,
        after_sequence: u64,
    ) -> Vec<Event> {
        self.state(topic)
            .lock()
            .await
            .window
            .iter()
            .filter(|e| e.partition() == node && e.sequence > after_sequence)
            .cloned()
            .collect()
    }

    /// Total events published per topic.
    pub async fn history(&self) -> BTreeMap<Topic, u64> {
        let mut out = BTreeMap::new();
        for (topic, state) in &self.topics {
            out.insert(*topic, state.lock().await.published);
        }
        out
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn dead_letter(&self, letter: DeadLetter) {
        push_dead_letter(&self.dead_letters, self.dead_letter_capacity, letter);
    }

    /// Stop every dispatcher. Pending critical publishes fail with `DeliveryFailure`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn push_dead_letter(store: &Mutex<VecDeque<DeadLetter>>, capacity: usize, letter: DeadLetter) {
    warn!(
        topic = %letter.event.topic,
        subscriber = %letter.subscriber,
        attempts = letter.attempts,
        error = %letter.error,
        "event dead-lettered"
    );
    let mut q = store.lock().unwrap_or_else(|e| e.into_inner());
    q.push_back(letter);
    while q.len() > capacity {
        q.pop_front();
    }
}

async fn deliver_once(
    subscriber: &dyn Subscriber,
    topic: Topic,
    policy: &TopicPolicy,
    event: &Event,
) -> Result<()> {
    match tokio::time::timeout(policy.timeout, subscriber.handle(event)).await {
        Ok(result) => result,
        Err(_) => Err(Error::delivery_failure(
            topic.as_str(),
            subscriber.name(),
            format!("handler exceeded {}ms", policy.timeout.as_millis()),
            policy.critical,
        )),
    }
}

/// One dispatcher per subscription: handles envelopes strictly in arrival order.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    topic: Topic,
    policy: TopicPolicy,
    subscriber: Arc<dyn Subscriber>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    retry: Arc<RetryPolicy>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    dead_letter_capacity: usize,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            next = rx.recv() => match next {
                Some(e) => e,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        if policy.critical {
            let result = deliver_once(subscriber.as_ref(), topic, &policy, &envelope.event).await;
            match envelope.ack {
                Some(ack) => {
                    let _ = ack.send(result);
                }
                None => {
                    if let Err(e) = result {
                        warn!(%topic, subscriber = subscriber.name(), error = %e, "delivery failed");
                    }
                }
            }
            continue;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match deliver_once(subscriber.as_ref(), topic, &policy, &envelope.event).await {
                Ok(()) => break,
                Err(e) if attempt > retry.max_retries => {
                    push_dead_letter(
                        &dead_letters,
                        dead_letter_capacity,
                        DeadLetter {
                            event: envelope.event.clone(),
                            subscriber: subscriber.name().to_string(),
                            error: e.to_string(),
                            attempts: attempt,
                            at: Utc::now(),
                        },
                    );
                    break;
                }
                Err(e) => {
                    warn!(%topic, subscriber = subscriber.name(), attempt, error = %e, "advisory delivery failed, retrying");
                    let backoff = retry.backoff.saturating_mul(2u32.saturating_pow(attempt - 1));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }
    debug!(%topic, subscriber = subscriber.name(), "dispatcher stopped");
}

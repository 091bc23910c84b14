//! Subscriber trait and a recording subscriber.

use keystone_core::{Event, Result, Topic};
use std::sync::Mutex;
use tokio::sync::Notify;

/// The Subscriber trait — implement this to receive events from the bus.
///
/// Handlers may be invoked more than once for the same event (at-least-once
/// delivery), so they must be idempotent; [`crate::IdempotencyGuard`] keyed by
/// `causal_id` or event id is the usual way. A handler returning `Err` or
/// exceeding the topic timeout counts as a failed delivery.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable name used in logs and delivery failures.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Keeps every event it receives, in delivery order.
pub struct Recorder {
    name: String,
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl Recorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn on_topic(&self, topic: Topic) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    /// Wait until `pred` holds over the recorded events, or the timeout elapses.
    pub async fn wait_for(
        &self,
        timeout: std::time::Duration,
        pred: impl Fn(&[Event]) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if pred(&self.events()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(&self.events());
            }
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

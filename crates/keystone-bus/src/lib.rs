//! keystone-bus — topic-partitioned publish/subscribe transport
//!
//! Every component talks to every other component through this bus. Events for the
//! same node keep their publish order per subscriber; delivery is at-least-once;
//! critical topics report delivery failures back to the publisher, advisory topics
//! retry with backoff and dead-letter what they cannot deliver.

pub mod bus;
pub mod idempotency;
pub mod subscriber;

pub use bus::{DeadLetter, EventBus, TopicPolicy};
pub use idempotency::IdempotencyGuard;
pub use subscriber::{Recorder, Subscriber};

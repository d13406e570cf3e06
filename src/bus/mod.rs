//! Event Bus Adapter: an opaque publish/subscribe sink with at-least-once
//! publish and per-key ordering, keyed by `aggregate_id`.
//!
//! The bus itself does not know about sagas or outbox rows — it moves
//! `BusMessage`s. Ordering per `aggregate_id` is the caller's (the Outbox
//! Relay's) responsibility to preserve on the publish side; this module's
//! job is to not reorder what it's handed.

mod memory;

pub use memory::InMemoryEventBus;

use async_trait::async_trait;

use crate::types::{BusError, BusMessage};

/// Publish/subscribe sink for outbox events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `message` to `topic`. At-least-once: a caller that doesn't
    /// receive `Ok` must assume the message may or may not have landed and
    /// retry; subscribers dedupe on `event_id`.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError>;

    /// Subscribe to `topic`, receiving all messages published to it from
    /// this point on.
    async fn subscribe(&self, topic: &str) -> tokio::sync::mpsc::Receiver<BusMessage>;

    /// Stop accepting new publishes and let in-flight subscribers drain.
    async fn shutdown(&self);
}

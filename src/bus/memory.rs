//! In-process `EventBus`, used by tests and by any deployment that colocates
//! participants and consumers in a single process.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{BusError, BusMessage};

use super::EventBus;

const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

/// Fans out published messages to every subscriber of a topic, in the order
/// `publish` was called. Subscribers that fall behind and fill their queue
/// cause `publish` to apply backpressure rather than drop messages.
pub struct InMemoryEventBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>,
    shutting_down: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BusError::ShuttingDown);
        }

        let senders = {
            let subs = self.subscribers.read();
            subs.get(topic).cloned().unwrap_or_default()
        };

        for sender in senders {
            if sender.send(message.clone()).await.is_err() {
                tracing::debug!(topic, event_id = %message.event_id, "subscriber dropped, skipping");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.subscribers.write().clear();
    }
}

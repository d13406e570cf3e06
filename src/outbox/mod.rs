//! Outbox Relay: runs inside each participant, independently of the Saga
//! Coordinator, draining pending outbox rows to the Event Bus.
//!
//! Polls on a fixed cadence, groups the batch by `aggregate_id` so a single
//! aggregate's events publish strictly in `created_at` order, and publishes
//! different aggregates' groups in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::OutboxConfig;
use crate::store::OutboxStore;
use crate::types::{BusMessage, OutboxRow};

/// Drains one participant's outbox to one topic on the event bus.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    topic: String,
    config: OutboxConfig,
    shutdown: Arc<Notify>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
        config: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            topic: topic.into(),
            config,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Signal used to stop the relay's background task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Start the poll loop on its own task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(relay.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = relay.drain_once().await {
                            tracing::error!(topic = %relay.topic, %err, "outbox relay tick failed");
                        }
                    }
                    _ = relay.shutdown.notified() => {
                        tracing::info!(topic = %relay.topic, "outbox relay shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Fetch one batch, group by `aggregate_id`, and publish each group
    /// serially while groups run concurrently. If the bus is slower than
    /// the poll interval, the next tick simply observes the same rows
    /// still `PENDING` — no queue grows in process memory.
    async fn drain_once(self: &Arc<Self>) -> Result<(), crate::types::StoreError> {
        let batch = self.store.fetch_pending(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<String, Vec<OutboxRow>> = BTreeMap::new();
        for row in batch {
            groups.entry(row.aggregate_id.clone()).or_default().push(row);
        }

        let handles: Vec<_> = groups
            .into_values()
            .map(|rows| {
                let relay = self.clone();
                tokio::spawn(async move { relay.publish_group(rows).await })
            })
            .collect();

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(%err, "outbox publish task panicked");
            }
        }
        Ok(())
    }

    /// Publish one aggregate's rows in order, stopping at the first
    /// failure within the group (later rows for the same aggregate must
    /// not jump ahead of an undelivered earlier one).
    async fn publish_group(self: Arc<Self>, rows: Vec<OutboxRow>) {
        for row in rows {
            let message = BusMessage::from(&row);
            match self.bus.publish(&self.topic, message).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_delivered(row.event_id).await {
                        tracing::error!(event_id = %row.event_id, %err, "failed to mark outbox row delivered");
                    }
                }
                Err(err) => {
                    tracing::warn!(event_id = %row.event_id, aggregate_id = %row.aggregate_id, %err, "publish failed, will retry");
                    if let Err(store_err) = self
                        .store
                        .record_publish_failure(row.event_id, self.config.dead_attempts)
                        .await
                    {
                        tracing::error!(event_id = %row.event_id, %store_err, "failed to record outbox publish failure");
                    }
                    break;
                }
            }
        }
    }
}

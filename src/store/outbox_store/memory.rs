//! In-memory `OutboxStore`, used by tests and single-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{EventId, OutboxRow, OutboxStatus, StoreError};

use super::OutboxStore;

#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: DashMap<EventId, OutboxRow>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, row: &OutboxRow) -> Result<(), StoreError> {
        self.rows.insert(row.event_id, row.clone());
        Ok(())
    }

    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxRow>, StoreError> {
        let mut pending: Vec<OutboxRow> = self
            .rows
            .iter()
            .filter(|r| r.value().status == OutboxStatus::Pending)
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.event_id.cmp(&b.event_id)));
        pending.truncate(batch_size);
        Ok(pending)
    }

    async fn mark_delivered(&self, event_id: EventId) -> Result<(), StoreError> {
        if let Some(mut row) = self.rows.get_mut(&event_id) {
            if row.status != OutboxStatus::Delivered {
                row.status = OutboxStatus::Delivered;
                row.delivered_at = Some(std::time::SystemTime::now());
            }
        }
        Ok(())
    }

    async fn record_publish_failure(&self, event_id: EventId, dead_after: u32) -> Result<(), StoreError> {
        if let Some(mut row) = self.rows.get_mut(&event_id) {
            row.attempt_count += 1;
            if row.attempt_count >= dead_after {
                row.status = OutboxStatus::Dead;
            }
        }
        Ok(())
    }
}

//! Durable storage for a single participant's outbox table, polled by the
//! `OutboxRelay`. A distinct trait from `StateStore` because the row shape
//! and query patterns (fetch-pending-by-status, mark-delivered) differ, but
//! grounded in the same single-row-transaction contract shared by the Saga
//! Log and the Outbox.

mod memory;
mod sqlite;

pub use memory::InMemoryOutboxStore;
pub use sqlite::SqliteOutboxStore;

use async_trait::async_trait;

use crate::types::{EventId, OutboxRow, StoreError};

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new row. In a real participant this happens in the same
    /// local transaction as the business mutation it describes; this
    /// trait only covers the outbox side of that transaction.
    async fn insert(&self, row: &OutboxRow) -> Result<(), StoreError>;

    /// Up to `batch_size` `PENDING` rows ordered by `created_at`, tie-broken
    /// by `event_id`, for the relay's next poll tick.
    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxRow>, StoreError>;

    /// Mark a row delivered. Idempotent: delivering an already-delivered
    /// row is a no-op, never un-delivers it.
    async fn mark_delivered(&self, event_id: EventId) -> Result<(), StoreError>;

    /// Record a failed publish attempt. Once `attempt_count` reaches
    /// `dead_after`, the row transitions to `DEAD` instead of `PENDING`.
    async fn record_publish_failure(&self, event_id: EventId, dead_after: u32) -> Result<(), StoreError>;
}

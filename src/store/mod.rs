//! The durable key/row store backing the saga log (and, via the same trait,
//! any participant-local table a test harness wants to model in-process).
//!
//! A `StateStore` guarantees read-after-write and atomic replacement on a
//! single key; it is not required to arbitrate concurrent writers to the
//! same key — the coordinator's leasing (see `crate::coordinator`) does that.

mod memory;
mod outbox_store;
mod sqlite;

pub use memory::InMemoryStateStore;
pub use outbox_store::{InMemoryOutboxStore, OutboxStore, SqliteOutboxStore};
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;

use crate::types::{SagaId, SagaInstance, StoreError};

/// Durable storage for saga instances, keyed by `saga_id`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Atomically replace (or insert) the row for `instance.saga_id`.
    async fn put(&self, instance: &SagaInstance) -> Result<(), StoreError>;

    /// Read the current row for `saga_id`, if any.
    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError>;

    /// All sagas whose status is not one of the terminal statuses, for the
    /// coordinator's recovery scan on startup.
    async fn list_non_terminal(&self) -> Result<Vec<SagaInstance>, StoreError>;

    /// Look up a saga by its client-supplied `Submit` idempotency key.
    async fn find_by_submit_key(&self, key: &str) -> Result<Option<SagaInstance>, StoreError>;
}

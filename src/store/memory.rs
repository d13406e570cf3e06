//! In-memory `StateStore`, useful for tests and for participants that don't
//! need cross-process durability.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::types::{SagaId, SagaInstance, StoreError};

use super::StateStore;

#[derive(Default)]
pub struct InMemoryStateStore {
    rows: DashMap<SagaId, SagaInstance>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        self.rows.insert(instance.saga_id, instance.clone());
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        Ok(self.rows.get(&saga_id).map(|r| r.value().clone()))
    }

    async fn list_non_terminal(&self) -> Result<Vec<SagaInstance>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| !r.value().status.is_terminal())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn find_by_submit_key(&self, key: &str) -> Result<Option<SagaInstance>, StoreError> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.value().submit_idempotency_key.as_deref() == Some(key))
            .map(|r| r.value().clone()))
    }
}

//! SQLite-backed `StateStore` for the saga log.
//!
//! A single connection behind a `tokio::sync::Mutex`, WAL mode for
//! concurrent readers, matching the saga log schema: `(saga_id PK,
//! definition_id, status, current_step_index, step_results_blob,
//! input_payload, owner_id, lease_expiry, created_at, updated_at,
//! deadline_at)`. No connection pooling — a saga row is small and writes
//! are already serialized by the coordinator's per-saga lease.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::types::{OwnerId, SagaId, SagaInstance, SagaStatus, StepResult, StoreError};

use super::StateStore;

pub struct SqliteStateStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS saga_log (
                saga_id            TEXT PRIMARY KEY,
                definition_id      TEXT NOT NULL,
                status             TEXT NOT NULL,
                current_step_index INTEGER NOT NULL,
                step_results_blob  TEXT NOT NULL,
                input_payload      BLOB NOT NULL,
                owner_id           TEXT,
                lease_expiry       TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL,
                deadline_at        TEXT,
                submit_idempotency_key TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_saga_log_status ON saga_log(status);
            CREATE INDEX IF NOT EXISTS idx_saga_log_submit_key ON saga_log(submit_idempotency_key);",
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

fn to_rfc3339(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339()
}

fn from_rfc3339(s: &str) -> Result<SystemTime, StoreError> {
    let dt = DateTime::parse_from_rfc3339(s).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(UNIX_EPOCH + Duration::from_millis(dt.timestamp_millis().max(0) as u64))
}

fn status_to_str(status: SagaStatus) -> &'static str {
    match status {
        SagaStatus::Started => "STARTED",
        SagaStatus::Running => "RUNNING",
        SagaStatus::Completed => "COMPLETED",
        SagaStatus::Compensating => "COMPENSATING",
        SagaStatus::Compensated => "COMPENSATED",
        SagaStatus::CompensationFailed => "COMPENSATION_FAILED",
        SagaStatus::Aborted => "ABORTED",
    }
}

fn status_from_str(s: &str) -> Result<SagaStatus, StoreError> {
    Ok(match s {
        "STARTED" => SagaStatus::Started,
        "RUNNING" => SagaStatus::Running,
        "COMPLETED" => SagaStatus::Completed,
        "COMPENSATING" => SagaStatus::Compensating,
        "COMPENSATED" => SagaStatus::Compensated,
        "COMPENSATION_FAILED" => SagaStatus::CompensationFailed,
        "ABORTED" => SagaStatus::Aborted,
        other => return Err(StoreError::Serialization(format!("unknown saga status {other}"))),
    })
}

fn row_to_instance(row: &rusqlite::Row) -> rusqlite::Result<Result<SagaInstance, StoreError>> {
    let saga_id_str: String = row.get(0)?;
    let definition_id: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let current_step_index: i64 = row.get(3)?;
    let step_results_blob: String = row.get(4)?;
    let input_payload: Vec<u8> = row.get(5)?;
    let owner_id_str: Option<String> = row.get(6)?;
    let lease_expiry_str: Option<String> = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let updated_at_str: String = row.get(9)?;
    let deadline_at_str: Option<String> = row.get(10)?;
    let submit_idempotency_key: Option<String> = row.get(11)?;

    let instance = (|| -> Result<SagaInstance, StoreError> {
        let saga_id: SagaId = saga_id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let status = status_from_str(&status_str)?;
        let step_results: Vec<StepResult> =
            serde_json::from_str(&step_results_blob).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let owner_id = owner_id_str
            .map(|s| s.parse::<uuid::Uuid>().map(OwnerId))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let lease_expiry = lease_expiry_str.map(|s| from_rfc3339(&s)).transpose()?;
        let deadline_at = deadline_at_str.map(|s| from_rfc3339(&s)).transpose()?;

        Ok(SagaInstance {
            saga_id,
            definition_id,
            status,
            current_step_index: current_step_index as usize,
            step_results,
            input_payload,
            created_at: from_rfc3339(&created_at_str)?,
            updated_at: from_rfc3339(&updated_at_str)?,
            deadline_at,
            submit_idempotency_key,
            owner_id,
            lease_expiry,
        })
    })();

    Ok(instance)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn put(&self, instance: &SagaInstance) -> Result<(), StoreError> {
        let step_results_blob =
            serde_json::to_string(&instance.step_results).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO saga_log
                (saga_id, definition_id, status, current_step_index, step_results_blob,
                 input_payload, owner_id, lease_expiry, created_at, updated_at, deadline_at,
                 submit_idempotency_key)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(saga_id) DO UPDATE SET
                definition_id = excluded.definition_id,
                status = excluded.status,
                current_step_index = excluded.current_step_index,
                step_results_blob = excluded.step_results_blob,
                owner_id = excluded.owner_id,
                lease_expiry = excluded.lease_expiry,
                updated_at = excluded.updated_at,
                deadline_at = excluded.deadline_at,
                submit_idempotency_key = excluded.submit_idempotency_key",
            rusqlite::params![
                instance.saga_id.to_string(),
                instance.definition_id,
                status_to_str(instance.status),
                instance.current_step_index as i64,
                step_results_blob,
                instance.input_payload,
                instance.owner_id.map(|o| o.0.to_string()),
                instance.lease_expiry.map(to_rfc3339),
                to_rfc3339(instance.created_at),
                to_rfc3339(instance.updated_at),
                instance.deadline_at.map(to_rfc3339),
                instance.submit_idempotency_key,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaInstance>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT saga_id, definition_id, status, current_step_index, step_results_blob,
                        input_payload, owner_id, lease_expiry, created_at, updated_at, deadline_at,
                        submit_idempotency_key
                 FROM saga_log WHERE saga_id = ?1",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![saga_id.to_string()], row_to_instance)
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match result {
            Some(Ok(instance)) => Ok(Some(instance)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn list_non_terminal(&self) -> Result<Vec<SagaInstance>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT saga_id, definition_id, status, current_step_index, step_results_blob,
                        input_payload, owner_id, lease_expiry, created_at, updated_at, deadline_at,
                        submit_idempotency_key
                 FROM saga_log
                 WHERE status NOT IN ('COMPLETED', 'COMPENSATED', 'COMPENSATION_FAILED', 'ABORTED')",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows = stmt
            .query_map([], row_to_instance)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut instances = Vec::new();
        for row in rows {
            instances.push(row.map_err(|e| StoreError::Backend(e.to_string()))??);
        }
        Ok(instances)
    }

    async fn find_by_submit_key(&self, key: &str) -> Result<Option<SagaInstance>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT saga_id, definition_id, status, current_step_index, step_results_blob,
                        input_payload, owner_id, lease_expiry, created_at, updated_at, deadline_at,
                        submit_idempotency_key
                 FROM saga_log WHERE submit_idempotency_key = ?1",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![key], row_to_instance)
            .optional()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match result {
            Some(Ok(instance)) => Ok(Some(instance)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SagaInstance, StepStatus};

    fn sample_instance() -> SagaInstance {
        let mut instance = SagaInstance::new(SagaId::new(), "order-fulfillment".into(), b"{}".to_vec(), 2);
        instance.submit_idempotency_key = Some("client-key".into());
        instance
    }

    #[tokio::test]
    async fn put_then_get_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStateStore::open(&dir.path().join("saga_log.db")).unwrap();
        let instance = sample_instance();

        store.put(&instance).await.unwrap();
        let reloaded = store.get(instance.saga_id).await.unwrap().unwrap();

        assert_eq!(reloaded.saga_id, instance.saga_id);
        assert_eq!(reloaded.definition_id, instance.definition_id);
        assert_eq!(reloaded.step_results.len(), 2);
        assert_eq!(reloaded.submit_idempotency_key.as_deref(), Some("client-key"));
    }

    #[tokio::test]
    async fn find_by_submit_key_and_list_non_terminal() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut instance = sample_instance();
        instance.step_results[0].status = StepStatus::Ok;
        store.put(&instance).await.unwrap();

        let found = store.find_by_submit_key("client-key").await.unwrap().unwrap();
        assert_eq!(found.saga_id, instance.saga_id);

        let non_terminal = store.list_non_terminal().await.unwrap();
        assert_eq!(non_terminal.len(), 1);

        instance.status = SagaStatus::Completed;
        store.put(&instance).await.unwrap();
        assert!(store.list_non_terminal().await.unwrap().is_empty());
    }
}

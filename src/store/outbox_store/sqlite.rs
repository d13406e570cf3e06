//! SQLite-backed `OutboxStore`, one database per participant. Schema
//! mirrors the logical outbox table: `(event_id PK, aggregate_type,
//! aggregate_id, event_type, payload, created_at, delivered_at,
//! attempt_count, status)`, with the two indexes the relay and the
//! per-aggregate drain both rely on.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{EventId, OutboxRow, OutboxStatus, StoreError};

use super::OutboxStore;

pub struct SqliteOutboxStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl SqliteOutboxStore {
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
            "CREATE TABLE IF NOT EXISTS outbox (
                event_id       TEXT PRIMARY KEY,
                aggregate_type TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                payload        BLOB NOT NULL,
                created_at     TEXT NOT NULL,
                delivered_at   TEXT,
                attempt_count  INTEGER NOT NULL,
                status         TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON outbox(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox(aggregate_id, created_at);",
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

fn status_to_str(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "PENDING",
        OutboxStatus::Delivered => "DELIVERED",
        OutboxStatus::Dead => "DEAD",
    }
}

fn status_from_str(s: &str) -> Result<OutboxStatus, StoreError> {
    Ok(match s {
        "PENDING" => OutboxStatus::Pending,
        "DELIVERED" => OutboxStatus::Delivered,
        "DEAD" => OutboxStatus::Dead,
        other => return Err(StoreError::Serialization(format!("unknown outbox status {other}"))),
    })
}

fn row_to_outbox_row(row: &rusqlite::Row) -> rusqlite::Result<Result<OutboxRow, StoreError>> {
    let event_id_str: String = row.get(0)?;
    let aggregate_type: String = row.get(1)?;
    let aggregate_id: String = row.get(2)?;
    let event_type: String = row.get(3)?;
    let payload: Vec<u8> = row.get(4)?;
    let created_at_str: String = row.get(5)?;
    let delivered_at_str: Option<String> = row.get(6)?;
    let attempt_count: i64 = row.get(7)?;
    let status_str: String = row.get(8)?;

    let parsed = (|| -> Result<OutboxRow, StoreError> {
        let event_id = EventId(
            event_id_str
                .parse::<uuid::Uuid>()
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        );
        Ok(OutboxRow {
            event_id,
            aggregate_type,
            aggregate_id,
            event_type,
            payload,
            created_at: from_rfc3339(&created_at_str)?,
            delivered_at: delivered_at_str.map(|s| from_rfc3339(&s)).transpose()?,
            attempt_count: attempt_count as u32,
            status: status_from_str(&status_str)?,
        })
    })();

    Ok(parsed)
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn insert(&self, row: &OutboxRow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO outbox
                (event_id, aggregate_type, aggregate_id, event_type, payload,
                 created_at, delivered_at, attempt_count, status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                row.event_id.to_string(),
                row.aggregate_type,
                row.aggregate_id,
                row.event_type,
                row.payload,
                to_rfc3339(row.created_at),
                row.delivered_at.map(to_rfc3339),
                row.attempt_count,
                status_to_str(row.status),
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn fetch_pending(&self, batch_size: usize) -> Result<Vec<OutboxRow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, aggregate_type, aggregate_id, event_type, payload,
                        created_at, delivered_at, attempt_count, status
                 FROM outbox
                 WHERE status = 'PENDING'
                 ORDER BY created_at ASC, event_id ASC
                 LIMIT ?1",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![batch_size as i64], row_to_outbox_row)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row.map_err(|e| StoreError::Backend(e.to_string()))??);
        }
        Ok(result)
    }

    async fn mark_delivered(&self, event_id: EventId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE outbox SET status = 'DELIVERED', delivered_at = ?2
             WHERE event_id = ?1 AND status != 'DELIVERED'",
            rusqlite::params![event_id.to_string(), to_rfc3339(SystemTime::now())],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn record_publish_failure(&self, event_id: EventId, dead_after: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE outbox SET attempt_count = attempt_count + 1 WHERE event_id = ?1",
            rusqlite::params![event_id.to_string()],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "UPDATE outbox SET status = 'DEAD' WHERE event_id = ?1 AND attempt_count >= ?2",
            rusqlite::params![event_id.to_string(), dead_after],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(aggregate_id: &str) -> OutboxRow {
        OutboxRow::new("Order", aggregate_id, "OrderCreated", b"{}".to_vec())
    }

    #[tokio::test]
    async fn insert_then_fetch_pending_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteOutboxStore::open(&dir.path().join("outbox.db")).unwrap();
        let row = row("order-1");
        store.insert(&row).await.unwrap();

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, row.event_id);
        assert_eq!(pending[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent_and_excludes_from_pending() {
        let store = SqliteOutboxStore::open_in_memory().unwrap();
        let row = row("order-1");
        store.insert(&row).await.unwrap();

        store.mark_delivered(row.event_id).await.unwrap();
        store.mark_delivered(row.event_id).await.unwrap();

        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_publish_failure_deadletters_past_threshold() {
        let store = SqliteOutboxStore::open_in_memory().unwrap();
        let row = row("order-1");
        store.insert(&row).await.unwrap();

        for _ in 0..3 {
            store.record_publish_failure(row.event_id, 3).await.unwrap();
        }

        assert!(store.fetch_pending(10).await.unwrap().is_empty());
    }
}

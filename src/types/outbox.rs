//! The transactional outbox row a participant writes alongside its business
//! mutation, and that the relay later publishes to the event bus.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::EventId;

/// Delivery status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Dead,
}

/// One row of a participant's local outbox table, inserted in the same
/// local transaction as the business mutation it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub event_id: EventId,
    /// Routing key; `aggregate_id` doubles as the bus partition key.
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    /// Opaque payload bytes; format is chosen by the participant.
    pub payload: Vec<u8>,
    pub created_at: SystemTime,
    pub delivered_at: Option<SystemTime>,
    pub attempt_count: u32,
    pub status: OutboxStatus,
}

impl OutboxRow {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            created_at: SystemTime::now(),
            delivered_at: None,
            attempt_count: 0,
            status: OutboxStatus::Pending,
        }
    }
}

/// A message as handed to the event bus: headers plus an opaque payload,
/// keyed by `aggregate_id` for partitioned, per-key ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub created_at: SystemTime,
}

impl From<&OutboxRow> for BusMessage {
    fn from(row: &OutboxRow) -> Self {
        Self {
            key: row.aggregate_id.clone(),
            payload: row.payload.clone(),
            event_id: row.event_id,
            event_type: row.event_type.clone(),
            aggregate_type: row.aggregate_type.clone(),
            created_at: row.created_at,
        }
    }
}

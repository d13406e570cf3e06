//! Core data model for the saga runtime: saga instances, outbox rows, and
//! the identifiers and small value types shared across subsystems.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod outbox;
pub mod saga;

pub use error::*;
pub use outbox::*;
pub use saga::*;

/// Unique identifier for a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaId(pub Uuid);

impl SagaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SagaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Globally unique identifier for an outbox event row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the coordinator instance currently leasing a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An idempotency key shared between a coordinator call and the participant
/// it invokes, guaranteeing repeated calls produce one effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// Build the key for a forward invocation of step `step_index` of `saga_id`:
    /// `saga_id || ":" || i`.
    pub fn for_invoke(saga_id: SagaId, step_index: usize) -> Self {
        Self(format!("{saga_id}:{step_index}"))
    }

    /// Build the key for a compensation call:
    /// `saga_id || ":" || j || ":C"`.
    pub fn for_compensate(saga_id: SagaId, step_index: usize) -> Self {
        Self(format!("{saga_id}:{step_index}:C"))
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

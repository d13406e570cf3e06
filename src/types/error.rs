//! Error types for the saga runtime.

use thiserror::Error;

use super::SagaId;

/// Top-level error aggregate for the runtime, composed from each
/// subsystem's own error type.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("saga coordinator error: {0}")]
    Coordinator(#[from] SagaError),

    #[error("participant adapter error: {0}")]
    Adapter(#[from] AdapterCallError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Errors raised by the saga coordinator.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    #[error("saga {saga_id} not found")]
    NotFound { saga_id: SagaId },

    #[error("saga {saga_id} is already terminal and cannot be mutated")]
    AlreadyTerminal { saga_id: SagaId },

    #[error("saga {saga_id} lease is not held by this coordinator instance")]
    LeaseNotHeld { saga_id: SagaId },

    #[error("unknown saga definition: {definition_id}")]
    UnknownDefinition { definition_id: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a participant adapter invocation.
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("transient failure calling {target}: {message}")]
    Transient { target: String, message: String },

    #[error("business rule violation calling {target}: {kind}")]
    Business { target: String, kind: String },

    #[error("participant {target} unavailable: {reason}")]
    Unavailable { target: String, reason: String },

    #[error("call to {target} timed out after {elapsed_ms}ms")]
    Timeout { target: String, elapsed_ms: u64 },

    #[error("call to {target} was canceled")]
    Canceled { target: String },

    #[error("fatal internal error in adapter for {target}: {message}")]
    FatalInternal { target: String, message: String },
}

impl AdapterError {
    /// Bucket this error into the coordinator's error-handling taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Transient { .. } => ErrorKind::Transient,
            AdapterError::Business { .. } => ErrorKind::Business,
            AdapterError::Unavailable { .. } => ErrorKind::Unavailable,
            AdapterError::Timeout { .. } => ErrorKind::Timeout,
            AdapterError::Canceled { .. } => ErrorKind::Canceled,
            AdapterError::FatalInternal { .. } => ErrorKind::FatalInternal,
        }
    }
}

/// The final error a `ParticipantAdapter` call surfaces to its caller once
/// retries are exhausted, carrying how many attempts it took so the
/// coordinator can record `StepResult::attempt_count`.
#[derive(Error, Debug, Clone)]
#[error("{source}")]
pub struct AdapterCallError {
    #[source]
    pub source: AdapterError,
    /// Attempts actually made against the wire. Zero when the breaker or
    /// bulkhead failed the call fast without an invocation.
    pub attempts: u32,
}

/// The error taxonomy an adapter buckets every failure into. Whether a given
/// kind is retried is a per-step choice (`StepDefinition::retryable_error_kinds`),
/// not a property of the kind itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Transient,
    Unavailable,
    Timeout,
    Business,
    Canceled,
    FatalInternal,
}

/// Errors raised by a `StateStore` implementation.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("row not found for key {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backing store error: {0}")]
    Backend(String),

    #[error("concurrent write conflict on key {0}")]
    Conflict(String),
}

/// Errors raised by the outbox relay.
#[derive(Error, Debug, Clone)]
pub enum OutboxError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Errors raised by an `EventBus` implementation.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("publish failed for aggregate {aggregate_id}: {reason}")]
    PublishFailed { aggregate_id: String, reason: String },

    #[error("bus is shutting down")]
    ShuttingDown,
}

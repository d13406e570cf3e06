//! Saga instance state, step results, and step definitions.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::{ErrorKind, IdempotencyKey, OwnerId, SagaId};

/// Status of a `SagaInstance`. The DAG of legal transitions is:
/// `Started -> Running -> {Completed | Compensating}`,
/// `Compensating -> {Compensated | CompensationFailed}`,
/// `Started -> Aborted` (only before any step runs), and
/// `Running -> Aborted` on a fatal internal error, where no compensation is
/// attempted and the saga is frozen for operator inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Started,
    Running,
    Completed,
    Compensating,
    Compensated,
    CompensationFailed,
    Aborted,
}

impl SagaStatus {
    /// Terminal statuses take no further action from the coordinator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Compensated
                | SagaStatus::CompensationFailed
                | SagaStatus::Aborted
        )
    }
}

/// Status of a single step's result within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Ok,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

/// Outcome of one step's forward (or compensating) invocation, aligned
/// positionally with the owning `StepDefinition` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    /// Opaque identifier returned by the participant (order id, reservation
    /// id, payment id, ...), recorded before `current_step_index` advances.
    pub handle: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub attempt_count: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            handle: None,
            error_kind: None,
            attempt_count: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A full saga instance: the unit of the saga log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub definition_id: String,
    pub status: SagaStatus,
    /// 0-based, monotonically non-decreasing until compensation begins.
    pub current_step_index: usize,
    /// One entry per step in the definition, in definition order.
    pub step_results: Vec<StepResult>,
    /// The original request, immutable for the lifetime of the saga.
    pub input_payload: Vec<u8>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub deadline_at: Option<SystemTime>,
    /// Caller-supplied idempotency key for `Submit`, if any.
    pub submit_idempotency_key: Option<String>,
    /// Coordinator instance currently allowed to drive this saga.
    pub owner_id: Option<OwnerId>,
    pub lease_expiry: Option<SystemTime>,
}

impl SagaInstance {
    pub fn new(saga_id: SagaId, definition_id: String, input_payload: Vec<u8>, step_count: usize) -> Self {
        let now = SystemTime::now();
        Self {
            saga_id,
            definition_id,
            status: SagaStatus::Started,
            current_step_index: 0,
            step_results: (0..step_count).map(|_| StepResult::pending()).collect(),
            input_payload,
            created_at: now,
            updated_at: now,
            deadline_at: None,
            submit_idempotency_key: None,
            owner_id: None,
            lease_expiry: None,
        }
    }

    /// Check the data-model invariants every transition must hold: step index
    /// in range, a `Completed` saga has every step `Ok`, and a saga that
    /// finished compensating has every affected step at a terminal
    /// compensation status. Used in tests and defensively before persisting
    /// a transition.
    pub fn check_invariants(&self, steps: &[StepDefinition]) -> Result<(), String> {
        if self.current_step_index > steps.len() {
            return Err(format!(
                "current_step_index {} exceeds step count {}",
                self.current_step_index,
                steps.len()
            ));
        }
        if self.status == SagaStatus::Completed
            && !self.step_results.iter().all(|r| r.status == StepStatus::Ok)
        {
            return Err("saga marked Completed but not every step is Ok".into());
        }
        if matches!(
            self.status,
            SagaStatus::Compensated | SagaStatus::CompensationFailed
        ) {
            for (i, result) in self.step_results.iter().enumerate() {
                let needs_compensation = result.status != StepStatus::Pending
                    && result.status != StepStatus::Failed
                    && steps[i].has_compensator();
                let reached_terminal = matches!(
                    result.status,
                    StepStatus::Compensated | StepStatus::CompensationFailed
                );
                if needs_compensation && !reached_terminal {
                    return Err(format!(
                        "step {i} had an effect but compensation never reached a terminal status"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A retry policy for a step's forward or compensating invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            factor: 2.0,
            cap: Duration::from_secs(2),
            max_attempts: 4,
        }
    }
}

/// Compile-time/config-time definition of one step in a saga, immutable at
/// run. `compensate_target` is `None` for steps with no undoable effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub invoke_target: String,
    pub compensate_target: Option<String>,
    pub timeout: Duration,
    /// `None` means inherit the adapter-level default built from
    /// `AdapterConfig`'s `retry_*` keys; `Some` overrides it for this step.
    pub retry_policy: Option<RetryPolicy>,
    pub retryable_error_kinds: HashSet<ErrorKind>,
}

impl StepDefinition {
    pub fn has_compensator(&self) -> bool {
        self.compensate_target.is_some()
    }
}

/// An ordered list of steps identified by a definition id, the unit a
/// `Submit` call names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub definition_id: String,
    pub steps: Vec<StepDefinition>,
}

/// A condensed, read-only view of a `SagaInstance` for `GetStatus` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStatusView {
    pub saga_id: SagaId,
    pub definition_id: String,
    pub status: SagaStatus,
    pub current_step_index: usize,
    pub step_results: Vec<StepResult>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl From<&SagaInstance> for SagaStatusView {
    fn from(instance: &SagaInstance) -> Self {
        Self {
            saga_id: instance.saga_id,
            definition_id: instance.definition_id.clone(),
            status: instance.status,
            current_step_index: instance.current_step_index,
            step_results: instance.step_results.clone(),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// A key supplied to a participant alongside its payload, letting the
/// participant deduplicate repeated calls.
pub type ParticipantIdempotencyKey = IdempotencyKey;

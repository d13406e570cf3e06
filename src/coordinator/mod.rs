//! Saga Coordinator: accepts a saga request, drives its steps through
//! Participant Adapters in order, persists every transition to the Saga
//! Log, and compensates in reverse on failure.
//!
//! A submitted saga runs on its own spawned task; `submit` returns as soon
//! as the `STARTED` row is durably written, and the saga makes progress
//! without further caller action, including across a crash (see `recover`).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::adapter::ParticipantAdapter;
use crate::config::CoordinatorConfig;
use crate::store::StateStore;
use crate::types::{
    ErrorKind, IdempotencyKey, OwnerId, SagaDefinition, SagaError, SagaId, SagaInstance, SagaStatus, SagaStatusView,
    StepResult, StepStatus,
};

/// Coordinates execution of sagas against a set of known definitions.
pub struct SagaCoordinator {
    store: Arc<dyn StateStore>,
    adapter: Arc<dyn ParticipantAdapter>,
    definitions: HashMap<String, SagaDefinition>,
    config: CoordinatorConfig,
    owner_id: OwnerId,
    cancel_flags: Arc<DashMap<SagaId, Arc<AtomicBool>>>,
}

impl SagaCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        adapter: Arc<dyn ParticipantAdapter>,
        definitions: Vec<SagaDefinition>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            definitions: definitions.into_iter().map(|d| (d.definition_id.clone(), d)).collect(),
            config,
            owner_id: OwnerId::new(),
            cancel_flags: Arc::new(DashMap::new()),
        }
    }

    /// Submit a new saga request. Returns the existing `saga_id` unchanged
    /// if `idempotency_key` matches a prior submission.
    pub async fn submit(
        &self,
        definition_id: &str,
        input: Vec<u8>,
        idempotency_key: Option<String>,
        deadline_at: Option<SystemTime>,
    ) -> Result<SagaId, SagaError> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self.store.find_by_submit_key(key).await? {
                return Ok(existing.saga_id);
            }
        }

        let definition = self
            .definitions
            .get(definition_id)
            .ok_or_else(|| SagaError::UnknownDefinition {
                definition_id: definition_id.to_string(),
            })?
            .clone();

        let saga_id = SagaId::new();
        let mut instance = SagaInstance::new(saga_id, definition_id.to_string(), input, definition.steps.len());
        instance.submit_idempotency_key = idempotency_key;
        instance.deadline_at = deadline_at;
        instance.owner_id = Some(self.owner_id);
        instance.lease_expiry = Some(SystemTime::now() + self.config.lease_ttl);
        self.store.put(&instance).await?;

        self.spawn_driver(instance, definition);
        Ok(saga_id)
    }

    /// A read-only projection of a saga's current state.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaStatusView, SagaError> {
        let instance = self.store.get(saga_id).await?.ok_or(SagaError::NotFound { saga_id })?;
        Ok(SagaStatusView::from(&instance))
    }

    /// Abort a non-terminal saga. Before any step has run this transitions
    /// directly to `ABORTED`; otherwise it signals the running driver to
    /// treat the in-flight step as `CANCELED` and begin compensation.
    pub async fn abort(&self, saga_id: SagaId) -> Result<(), SagaError> {
        let mut instance = self.store.get(saga_id).await?.ok_or(SagaError::NotFound { saga_id })?;
        if instance.status.is_terminal() {
            return Err(SagaError::AlreadyTerminal { saga_id });
        }

        if instance.status == SagaStatus::Started && instance.current_step_index == 0 {
            instance.status = SagaStatus::Aborted;
            instance.updated_at = SystemTime::now();
            self.store.put(&instance).await?;
            return Ok(());
        }

        if let Some(flag) = self.cancel_flags.get(&saga_id) {
            flag.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Scan the Saga Log for non-terminal sagas this instance should drive:
    /// either their lease has expired or we already own it. Call once at
    /// startup, before accepting new traffic.
    pub async fn recover(&self) -> Result<(), SagaError> {
        let pending = self.store.list_non_terminal().await?;
        let now = SystemTime::now();

        for mut instance in pending {
            let lease_expired = instance.lease_expiry.map(|expiry| expiry <= now).unwrap_or(true);
            let owned_by_us = instance.owner_id == Some(self.owner_id);
            if !lease_expired && !owned_by_us {
                continue;
            }

            let Some(definition) = self.definitions.get(&instance.definition_id).cloned() else {
                tracing::warn!(
                    saga_id = %instance.saga_id,
                    definition_id = %instance.definition_id,
                    "recovered saga names an unknown definition, skipping"
                );
                continue;
            };

            instance.owner_id = Some(self.owner_id);
            instance.lease_expiry = Some(now + self.config.lease_ttl);
            self.store.put(&instance).await?;

            tracing::info!(saga_id = %instance.saga_id, status = ?instance.status, "resuming saga on recovery");
            self.spawn_driver(instance, definition);
        }
        Ok(())
    }

    fn spawn_driver(&self, instance: SagaInstance, definition: SagaDefinition) {
        let saga_id = instance.saga_id;
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.insert(saga_id, cancel_flag.clone());

        let store = self.store.clone();
        let adapter = self.adapter.clone();
        let config = self.config.clone();
        let cancel_flags = self.cancel_flags.clone();

        tokio::spawn(async move {
            let mut driver = SagaDriver {
                store,
                adapter,
                definition,
                config,
                cancel_flag,
            };
            if let Err(err) = driver.run(instance).await {
                tracing::error!(%saga_id, %err, "saga driver exited with an unrecoverable error");
            }
            cancel_flags.remove(&saga_id);
        });
    }
}

struct SagaDriver {
    store: Arc<dyn StateStore>,
    adapter: Arc<dyn ParticipantAdapter>,
    definition: SagaDefinition,
    config: CoordinatorConfig,
    cancel_flag: Arc<AtomicBool>,
}

impl SagaDriver {
    async fn run(&mut self, mut instance: SagaInstance) -> Result<(), SagaError> {
        match instance.status {
            SagaStatus::Started => {
                instance.status = SagaStatus::Running;
                self.persist(&mut instance).await?;
                self.run_forward(&mut instance).await?;
            }
            SagaStatus::Running => {
                self.run_forward(&mut instance).await?;
            }
            SagaStatus::Compensating => {
                self.run_compensation(&mut instance).await?;
            }
            SagaStatus::Completed
            | SagaStatus::Compensated
            | SagaStatus::CompensationFailed
            | SagaStatus::Aborted => {}
        }
        Ok(())
    }

    async fn run_forward(&mut self, instance: &mut SagaInstance) -> Result<(), SagaError> {
        while instance.current_step_index < self.definition.steps.len() {
            let i = instance.current_step_index;
            let step = self.definition.steps[i].clone();

            if self.cancel_flag.load(Ordering::Acquire) {
                instance.step_results[i] = failed_result(instance.step_results[i].clone(), ErrorKind::Canceled);
                self.persist(instance).await?;
                return self.enter_compensation(instance).await;
            }

            if instance.deadline_at.is_some_and(|deadline| deadline <= SystemTime::now()) {
                instance.step_results[i] = failed_result(instance.step_results[i].clone(), ErrorKind::Timeout);
                self.persist(instance).await?;
                tracing::warn!(saga_id = %instance.saga_id, step = %step.name, "saga deadline exceeded, entering compensation");
                return self.enter_compensation(instance).await;
            }

            instance.step_results[i] = StepResult {
                status: StepStatus::Pending,
                handle: None,
                error_kind: None,
                attempt_count: 0,
                started_at: Some(SystemTime::now()),
                finished_at: None,
            };
            self.persist(instance).await?;

            let key = IdempotencyKey::for_invoke(instance.saga_id, i);
            let projection = instance.input_payload.clone();

            let result = self
                .call_with_heartbeat(instance, |adapter| {
                    let step = step.clone();
                    let key = key.clone();
                    let projection = projection.clone();
                    async move { adapter.invoke(&step, key, &projection).await }
                })
                .await;

            match result {
                Ok(outcome) => {
                    instance.step_results[i].status = StepStatus::Ok;
                    instance.step_results[i].handle = Some(outcome.value);
                    instance.step_results[i].attempt_count = outcome.attempts;
                    instance.step_results[i].finished_at = Some(SystemTime::now());
                    instance.current_step_index += 1;
                    self.persist(instance).await?;
                }
                Err(failure) => {
                    let kind = failure.source.kind();
                    instance.step_results[i].status = StepStatus::Failed;
                    instance.step_results[i].error_kind = Some(kind);
                    instance.step_results[i].attempt_count = failure.attempts;
                    instance.step_results[i].finished_at = Some(SystemTime::now());
                    self.persist(instance).await?;

                    if kind == ErrorKind::FatalInternal {
                        // A fatal internal error aborts without driving compensation.
                        // Reusing `CompensationFailed` here would misrepresent every
                        // prior-OK step as having attempted and failed compensation,
                        // which never happens on this path.
                        tracing::error!(saga_id = %instance.saga_id, step = %step.name, error = %failure.source, "fatal internal error, aborting saga without compensation");
                        instance.status = SagaStatus::Aborted;
                        self.persist(instance).await?;
                        return Ok(());
                    }

                    tracing::warn!(saga_id = %instance.saga_id, step = %step.name, error = %failure.source, "step failed, entering compensation");
                    return self.enter_compensation(instance).await;
                }
            }
        }

        instance.status = SagaStatus::Completed;
        self.persist(instance).await?;
        Ok(())
    }

    async fn enter_compensation(&mut self, instance: &mut SagaInstance) -> Result<(), SagaError> {
        instance.status = SagaStatus::Compensating;
        self.persist(instance).await?;
        self.run_compensation(instance).await
    }

    async fn run_compensation(&mut self, instance: &mut SagaInstance) -> Result<(), SagaError> {
        let mut any_failed = false;

        let start = if instance.current_step_index >= self.definition.steps.len() {
            self.definition.steps.len()
        } else {
            instance.current_step_index
        };

        for j in (0..start).rev() {
            let step = self.definition.steps[j].clone();
            let result = &instance.step_results[j];

            if result.status != StepStatus::Ok || !step.has_compensator() {
                continue;
            }
            if matches!(result.status, StepStatus::Compensated | StepStatus::CompensationFailed) {
                continue;
            }

            let handle = result.handle.clone().unwrap_or_default();
            instance.step_results[j].status = StepStatus::Compensating;
            self.persist(instance).await?;

            let key = IdempotencyKey::for_compensate(instance.saga_id, j);
            let outcome = self
                .call_with_heartbeat(instance, |adapter| {
                    let step = step.clone();
                    let key = key.clone();
                    let handle = handle.clone();
                    async move { adapter.compensate(&step, key, &handle).await }
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    instance.step_results[j].status = StepStatus::Compensated;
                    instance.step_results[j].attempt_count = outcome.attempts;
                }
                Err(failure) => {
                    tracing::error!(saga_id = %instance.saga_id, step = %step.name, error = %failure.source, "compensation exhausted retries");
                    instance.step_results[j].status = StepStatus::CompensationFailed;
                    instance.step_results[j].attempt_count = failure.attempts;
                    any_failed = true;
                }
            }
            self.persist(instance).await?;
        }

        instance.status = if any_failed {
            SagaStatus::CompensationFailed
        } else {
            SagaStatus::Compensated
        };
        self.persist(instance).await?;
        Ok(())
    }

    /// Run `make_call` against the adapter while racing a heartbeat tick
    /// that refreshes the saga's lease, so a long adapter call doesn't let
    /// the lease expire out from under this driver.
    async fn call_with_heartbeat<F, Fut, T>(&self, instance: &mut SagaInstance, make_call: F) -> T
    where
        F: FnOnce(&Arc<dyn ParticipantAdapter>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let call = make_call(&self.adapter);
        tokio::pin!(call);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = heartbeat.tick() => {
                    instance.lease_expiry = Some(SystemTime::now() + self.config.lease_ttl);
                    instance.updated_at = SystemTime::now();
                    if let Err(err) = self.store.put(instance).await {
                        tracing::warn!(saga_id = %instance.saga_id, %err, "lease heartbeat write failed");
                    }
                }
            }
        }
    }

    async fn persist(&self, instance: &mut SagaInstance) -> Result<(), SagaError> {
        instance.updated_at = SystemTime::now();
        if let Err(msg) = instance.check_invariants(&self.definition.steps) {
            tracing::error!(saga_id = %instance.saga_id, invariant = %msg, "refusing to persist a saga transition that violates an invariant");
            return Err(SagaError::InvariantViolation(msg));
        }
        self.store.put(instance).await?;
        Ok(())
    }
}

fn failed_result(mut result: StepResult, kind: ErrorKind) -> StepResult {
    result.status = StepStatus::Failed;
    result.error_kind = Some(kind);
    result.finished_at = Some(SystemTime::now());
    result
}

/// Retryable error kinds a step definition names, used by the adapter; kept
/// here only so callers constructing `StepDefinition`s by hand have a
/// sensible default to start from.
pub fn default_retryable_kinds() -> HashSet<ErrorKind> {
    [ErrorKind::Transient, ErrorKind::Unavailable, ErrorKind::Timeout]
        .into_iter()
        .collect()
}

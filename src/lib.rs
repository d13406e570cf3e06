//! Saga coordinator with a transactional outbox.
//!
//! Executes a multi-step business transaction across independently-owned
//! services without a distributed commit protocol: the [`coordinator`]
//! drives an ordered list of steps forward through [`adapter`]-wrapped
//! participants, persisting every transition to a [`store::StateStore`]
//! saga log for crash recovery, and compensates in reverse on failure.
//! Each participant's business write and event write land in one local
//! transaction (the transactional outbox), and an [`outbox::OutboxRelay`]
//! later publishes those events to an [`bus::EventBus`].

pub mod adapter;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod outbox;
pub mod store;
pub mod types;

pub use config::{AdapterConfig, ConfigError, CoordinatorConfig, OutboxConfig, RuntimeConfig};
pub use coordinator::SagaCoordinator;
pub use types::{RuntimeError, SagaId};

use std::sync::Arc;

use crate::adapter::ParticipantAdapter;
use crate::bus::EventBus;
use crate::store::{OutboxStore, StateStore};
use crate::types::SagaDefinition;

/// Top-level composition of a saga coordinator and the outbox relays that
/// run alongside it, wired from one [`RuntimeConfig`].
///
/// Constructing a `SagaRuntime` does not start anything; call [`Self::start`]
/// once all participant adapters and outbox stores are registered.
pub struct SagaRuntime {
    pub coordinator: Arc<SagaCoordinator>,
    relays: Vec<Arc<outbox::OutboxRelay>>,
}

impl SagaRuntime {
    /// Build a runtime around a saga log, a shared participant adapter, and
    /// the known saga definitions. Register outbox relays separately with
    /// [`Self::add_outbox_relay`] — each participant owns its own outbox
    /// table and, in a real deployment, its own process.
    pub fn new(
        state_store: Arc<dyn StateStore>,
        adapter: Arc<dyn ParticipantAdapter>,
        definitions: Vec<SagaDefinition>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            coordinator: Arc::new(SagaCoordinator::new(state_store, adapter, definitions, config.coordinator)),
            relays: Vec::new(),
        }
    }

    /// Register an outbox relay for one participant's outbox table and
    /// topic. Must be called before [`Self::start`].
    pub fn add_outbox_relay(&mut self, store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, topic: impl Into<String>, config: OutboxConfig) {
        self.relays.push(outbox::OutboxRelay::new(store, bus, topic, config));
    }

    /// Run the coordinator's recovery scan, then spawn every registered
    /// outbox relay. Call once at process start, before accepting new
    /// `submit` traffic.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.coordinator.recover().await?;
        for relay in &self.relays {
            relay.spawn();
        }
        Ok(())
    }

    /// Stop accepting new work on every outbox relay. The Saga Coordinator
    /// itself has no separate shutdown call: in-flight saga drivers finish
    /// (or are interrupted by process exit) on their own tasks.
    pub async fn shutdown(&self) {
        for relay in &self.relays {
            relay.shutdown_handle().notify_one();
        }
    }
}

//! CAF onboarding correlation engine.
//!
//! Components receive their dependencies explicitly; [`OnboardingServices`]
//! wires one of each around a shared store and a shared lock table.

pub mod activation;
pub mod engine;
pub mod ingestion;
pub mod key_lock;
pub mod lifecycle;
pub mod memory;
pub mod provisioner;
pub mod routing;
pub mod signal_dispatcher;
pub mod store;
pub mod tokens;
pub mod types;

use std::sync::Arc;

pub use activation::{ActivationApi, ActivationRequest, ActivationRouter, DispatchReceipt};
pub use engine::ProcessEngine;
pub use ingestion::{IngestOutcome, IngestionGate, IngestionWorker};
pub use key_lock::KeyedLocks;
pub use lifecycle::ProcessLifecycleManager;
pub use provisioner::IdentityProvisioner;
pub use routing::ZoneRoutingTable;
pub use signal_dispatcher::{CallbackOutcome, SignalDispatcher};
pub use store::{CorrelationStore, DeadLetterSink, StagingSink};
pub use tokens::CorrelationIdIssuer;
pub use types::*;

use crate::config::OnboardingConfig;
use crate::error::{OnboardingError, OnboardingResult};

/// External capabilities the engine is built over.
pub struct OnboardingDeps {
    pub store: Arc<dyn CorrelationStore>,
    pub engine: Arc<dyn ProcessEngine>,
    pub provisioner: Arc<dyn IdentityProvisioner>,
    pub activation_api: Arc<dyn ActivationApi>,
    pub staging: Arc<dyn StagingSink>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub routing: ZoneRoutingTable,
}

/// Fully wired components sharing one store and one lock table.
#[derive(Clone)]
pub struct OnboardingServices {
    pub store: Arc<dyn CorrelationStore>,
    pub gate: Arc<IngestionGate>,
    pub lifecycle: Arc<ProcessLifecycleManager>,
    pub activation: Arc<ActivationRouter>,
    pub signals: Arc<SignalDispatcher>,
    pub routing: Arc<ZoneRoutingTable>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub locks: KeyedLocks,
}

impl OnboardingServices {
    pub fn new(deps: OnboardingDeps, config: &OnboardingConfig) -> Self {
        let locks = KeyedLocks::new();
        let routing = Arc::new(deps.routing);
        let issuer = CorrelationIdIssuer::new(Arc::clone(&deps.store));

        let lifecycle = Arc::new(ProcessLifecycleManager::new(
            Arc::clone(&deps.store),
            deps.engine,
            locks.clone(),
            config.engine.clone(),
            config.retry,
        ));
        let gate = Arc::new(IngestionGate::new(
            Arc::clone(&deps.store),
            deps.provisioner,
            Arc::clone(&lifecycle),
            locks.clone(),
            config.provisioner.timeout(),
        ));
        let activation = Arc::new(ActivationRouter::new(
            Arc::clone(&deps.store),
            issuer.clone(),
            Arc::clone(&routing),
            deps.activation_api,
            deps.staging,
            locks.clone(),
            config.activation.clone(),
        ));
        let signals = Arc::new(SignalDispatcher::new(
            Arc::clone(&deps.store),
            issuer,
            Arc::clone(&lifecycle),
            Arc::clone(&deps.dead_letters),
            locks.clone(),
            config.steps.clone(),
        ));

        Self {
            store: deps.store,
            gate,
            lifecycle,
            activation,
            signals,
            routing,
            dead_letters: deps.dead_letters,
            locks,
        }
    }

    pub fn ingestion_worker(&self) -> Arc<IngestionWorker> {
        Arc::new(IngestionWorker::new(
            Arc::clone(&self.gate),
            Arc::clone(&self.dead_letters),
        ))
    }

    pub async fn find_record(&self, business_ref: &str) -> OnboardingResult<OnboardingRecord> {
        self.store
            .find_by_ref(business_ref)
            .await?
            .ok_or_else(|| OnboardingError::RecordNotFound {
                business_ref: business_ref.to_string(),
            })
    }
}

//! Per-step outbound activation: route, issue a token, send.
//!
//! The engine's service task asks for a step to be dispatched. The zone
//! routing table picks the API or staging route, the issuer mints a fresh
//! correlation token, and the record moves to the step's pending substate.
//! The key lock is held across the send, so a fast callback for the new token
//! waits until the pending status is written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::key_lock::KeyedLocks;
use super::routing::ZoneRoutingTable;
use super::store::{CorrelationStore, StagingRow, StagingSink};
use super::tokens::CorrelationIdIssuer;
use super::types::{ActivationStep, OnboardingRecord, RecordStatus, RouteMode};
use crate::config::ActivationConfig;
use crate::error::{ActivationError, OnboardingError, OnboardingResult};

/// Body of a synchronous activation API request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    pub caf_ref_no: String,
    pub imsi: Option<String>,
    pub correlation_id: String,
    pub callback_url: String,
}

/// Synchronous activation endpoint on the telco side.
#[async_trait]
pub trait ActivationApi: Send + Sync {
    async fn send(&self, step: ActivationStep, request: &ActivationRequest) -> Result<(), ActivationError>;
}

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub business_ref: String,
    pub step: ActivationStep,
    pub route: RouteMode,
    pub correlation_token: String,
    /// False when the API call timed out or dropped: the request may or may
    /// not have arrived, and the callback settles it either way.
    pub confirmed: bool,
    pub status: RecordStatus,
}

pub struct ActivationRouter {
    store: Arc<dyn CorrelationStore>,
    issuer: CorrelationIdIssuer,
    routing: Arc<ZoneRoutingTable>,
    api: Arc<dyn ActivationApi>,
    staging: Arc<dyn StagingSink>,
    locks: KeyedLocks,
    config: ActivationConfig,
}

impl ActivationRouter {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        issuer: CorrelationIdIssuer,
        routing: Arc<ZoneRoutingTable>,
        api: Arc<dyn ActivationApi>,
        staging: Arc<dyn StagingSink>,
        locks: KeyedLocks,
        config: ActivationConfig,
    ) -> Self {
        Self {
            store,
            issuer,
            routing,
            api,
            staging,
            locks,
            config,
        }
    }

    /// Dispatch `step` for an approved record or one whose previous step acked.
    pub async fn dispatch_step(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> OnboardingResult<DispatchReceipt> {
        let _guard = self.locks.lock(business_ref).await;
        let record = self.load(business_ref).await?;
        if !record.status.accepts_dispatch() {
            return Err(OnboardingError::InvalidTransition {
                business_ref: business_ref.to_string(),
                status: record.status,
                operation: format!("dispatch {}", step),
            });
        }
        self.dispatch_locked(&record, step).await
    }

    /// Re-dispatch a step that was negatively acknowledged.
    ///
    /// The new token supersedes the old one, so a late callback for the
    /// failed attempt is discarded as stale.
    pub async fn retry_step(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> OnboardingResult<DispatchReceipt> {
        let _guard = self.locks.lock(business_ref).await;
        let record = self.load(business_ref).await?;
        if record.status != RecordStatus::StepFailed(step) {
            return Err(OnboardingError::InvalidTransition {
                business_ref: business_ref.to_string(),
                status: record.status,
                operation: format!("retry {}", step),
            });
        }
        tracing::info!(
            business_ref = business_ref,
            step = %step,
            "Manual step retry"
        );
        self.dispatch_locked(&record, step).await
    }

    async fn load(&self, business_ref: &str) -> OnboardingResult<OnboardingRecord> {
        self.store
            .find_by_ref(business_ref)
            .await?
            .ok_or_else(|| OnboardingError::RecordNotFound {
                business_ref: business_ref.to_string(),
            })
    }

    async fn dispatch_locked(
        &self,
        record: &OnboardingRecord,
        step: ActivationStep,
    ) -> OnboardingResult<DispatchReceipt> {
        let business_ref = record.business_ref.as_str();

        // Resolve first: an unconfigured zone must not leave a token behind.
        let route = self.routing.resolve_route(&record.zone_code, step)?;
        let token = self.issuer.issue(step, business_ref).await?;

        let sent = match route {
            RouteMode::Api => self.send_api(record, step, &token.token).await,
            RouteMode::Staging => self.stage(record, step, &token.token).await.map(|()| true),
        };
        let confirmed = match sent {
            Ok(confirmed) => confirmed,
            Err(e) => {
                // Nothing was handed over, so nothing can call back with it.
                if let Err(retire_err) = self
                    .store
                    .consume_token(business_ref, step, &token.token)
                    .await
                {
                    tracing::warn!(
                        business_ref = business_ref,
                        step = %step,
                        error = %retire_err,
                        "Could not retire undelivered correlation token"
                    );
                }
                return Err(e);
            }
        };

        let status = RecordStatus::StepPending(step);
        self.store.update_status(business_ref, status).await?;

        tracing::info!(
            business_ref = business_ref,
            step = %step,
            route = %route,
            confirmed = confirmed,
            "Activation step dispatched"
        );
        Ok(DispatchReceipt {
            business_ref: business_ref.to_string(),
            step,
            route,
            correlation_token: token.token,
            confirmed,
            status,
        })
    }

    async fn stage(
        &self,
        record: &OnboardingRecord,
        step: ActivationStep,
        token: &str,
    ) -> OnboardingResult<()> {
        let row = StagingRow {
            business_ref: record.business_ref.clone(),
            step,
            correlation_token: token.to_string(),
            identity: record.activation_identity().map(str::to_string),
            plan_code: record.plan_code.clone(),
            zone_code: record.zone_code.clone(),
            created_at: Utc::now(),
        };
        self.staging.insert(&row).await?;
        Ok(())
    }

    /// `Ok(false)` when the outcome is ambiguous.
    async fn send_api(
        &self,
        record: &OnboardingRecord,
        step: ActivationStep,
        token: &str,
    ) -> OnboardingResult<bool> {
        let request = ActivationRequest {
            caf_ref_no: record.business_ref.clone(),
            imsi: record.activation_identity().map(str::to_string),
            correlation_id: token.to_string(),
            callback_url: self.config.callback_url(step, token),
        };

        let timeout = self.config.timeout();
        let result = match tokio::time::timeout(timeout, self.api.send(step, &request)).await {
            Ok(result) => result,
            Err(_) => Err(ActivationError::Timeout {
                step,
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_ambiguous() => {
                // Re-sending could double-activate; the token stays
                // outstanding and the callback decides.
                tracing::warn!(
                    business_ref = %record.business_ref,
                    step = %step,
                    error = %e,
                    "Activation request outcome unknown"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(
                    business_ref = %record.business_ref,
                    step = %step,
                    error = %e,
                    "Activation request rejected"
                );
                Err(e.into())
            }
        }
    }
}

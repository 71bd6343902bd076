//! Signal Dispatcher: resolves activation callbacks to engine signals.
//!
//! A callback carries the correlation token in its URL. The token alone
//! names the step and the business reference; the store only confirms it is
//! still the outstanding one. Malformed callbacks are dead-lettered, stale
//! ones acknowledged and dropped.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::key_lock::KeyedLocks;
use super::lifecycle::ProcessLifecycleManager;
use super::store::{CorrelationStore, DeadLetter, DeadLetterSink, DeadLetterSource};
use super::tokens::{parse_token, CorrelationIdIssuer, ParsedToken};
use super::types::{AckStatus, ActivationStep, RecordStatus, Variables};
use crate::config::StepPolicies;
use crate::error::{OnboardingError, OnboardingResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallbackBody {
    #[serde(default)]
    caf_ref_no: Option<String>,
    ack_status: String,
}

/// Result of a handled callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CallbackOutcome {
    /// Signal forwarded and status advanced.
    Applied {
        business_ref: String,
        step: ActivationStep,
        ack_status: AckStatus,
        status: RecordStatus,
    },
    /// Duplicate or superseded token; no state changed.
    Discarded {
        business_ref: String,
        step: ActivationStep,
    },
}

pub struct SignalDispatcher {
    store: Arc<dyn CorrelationStore>,
    issuer: CorrelationIdIssuer,
    lifecycle: Arc<ProcessLifecycleManager>,
    dead_letters: Arc<dyn DeadLetterSink>,
    locks: KeyedLocks,
    steps: StepPolicies,
}

impl SignalDispatcher {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        issuer: CorrelationIdIssuer,
        lifecycle: Arc<ProcessLifecycleManager>,
        dead_letters: Arc<dyn DeadLetterSink>,
        locks: KeyedLocks,
        steps: StepPolicies,
    ) -> Self {
        Self {
            store,
            issuer,
            lifecycle,
            dead_letters,
            locks,
            steps,
        }
    }

    /// Handle `POST /callback/{target}/{token}` with the raw request body.
    pub async fn handle_callback(
        &self,
        target: &str,
        token: &str,
        body: &[u8],
    ) -> OnboardingResult<CallbackOutcome> {
        match self.apply(target, token, body).await {
            Err(OnboardingError::StaleToken { business_ref, step }) => {
                tracing::info!(
                    business_ref = %business_ref,
                    step = %step,
                    "Stale callback discarded"
                );
                Ok(CallbackOutcome::Discarded { business_ref, step })
            }
            Err(e) if e.is_dead_letter() => {
                self.dead_letter(target, token, body, &e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn apply(&self, target: &str, token: &str, body: &[u8]) -> OnboardingResult<CallbackOutcome> {
        let parsed = parse_token(token)?;
        let ack_status = self.check_request(&parsed, target, body)?;
        let business_ref = parsed.business_ref.as_str();
        let step = parsed.step;

        let _guard = self.locks.lock(business_ref).await;
        self.issuer.validate(&parsed).await?;

        let record = self.store.find_by_ref(business_ref).await?.ok_or_else(|| {
            OnboardingError::RecordNotFound {
                business_ref: business_ref.to_string(),
            }
        })?;

        if record.status.is_terminal() {
            // Nothing left to signal; retire the token so redeliveries go stale.
            self.issuer.consume(&parsed).await?;
            tracing::info!(
                business_ref = business_ref,
                step = %step,
                status = %record.status,
                "Callback for terminal record discarded"
            );
            return Ok(CallbackOutcome::Discarded {
                business_ref: business_ref.to_string(),
                step,
            });
        }
        if record.status != RecordStatus::StepPending(step) {
            return Err(OnboardingError::InvalidTransition {
                business_ref: business_ref.to_string(),
                status: record.status,
                operation: format!("apply {} callback", step),
            });
        }

        let signal_name = step.signal_name(ack_status);
        let mut payload = Variables::new();
        payload.insert("cafRefNo".to_string(), json!(business_ref));
        payload.insert("step".to_string(), json!(step.as_str()));
        payload.insert("ackStatus".to_string(), json!(ack_status.as_str()));
        payload.insert("correlationId".to_string(), json!(parsed.raw));

        // A failed signal leaves the token outstanding so the sender's retry
        // is not mistaken for a duplicate.
        match self
            .lifecycle
            .signal_locked(business_ref, signal_name, &payload)
            .await
        {
            Ok(_) => {}
            // The token is outstanding and the step pending, so only an earlier
            // attempt of this callback whose settle was lost can have used up
            // the subscription.
            Err(OnboardingError::Engine(e)) if e.is_not_found() => {
                tracing::info!(
                    business_ref = business_ref,
                    step = %step,
                    signal = signal_name,
                    "Signal subscription already used by an earlier attempt"
                );
            }
            Err(e) => return Err(e),
        }

        let status = match ack_status {
            AckStatus::Success => RecordStatus::StepAcked(step),
            AckStatus::Failure if self.steps.is_critical(step) => RecordStatus::Failed,
            AckStatus::Failure => RecordStatus::StepFailed(step),
        };
        if !self.issuer.settle(&parsed, status).await? {
            return Err(OnboardingError::StaleToken {
                business_ref: business_ref.to_string(),
                step,
            });
        }

        match status {
            RecordStatus::Failed => tracing::warn!(
                business_ref = business_ref,
                step = %step,
                "Critical step negatively acknowledged, record failed"
            ),
            RecordStatus::StepFailed(_) => tracing::warn!(
                business_ref = business_ref,
                step = %step,
                "Step negatively acknowledged, awaiting manual retry"
            ),
            _ => tracing::info!(
                business_ref = business_ref,
                step = %step,
                signal = signal_name,
                "Step acknowledged"
            ),
        }

        Ok(CallbackOutcome::Applied {
            business_ref: business_ref.to_string(),
            step,
            ack_status,
            status,
        })
    }

    /// Validate everything that needs no store access.
    fn check_request(
        &self,
        parsed: &ParsedToken,
        target: &str,
        body: &[u8],
    ) -> OnboardingResult<AckStatus> {
        let target_step = ActivationStep::from_target(target).ok_or_else(|| {
            OnboardingError::malformed_token(&parsed.raw, format!("unknown callback target '{}'", target))
        })?;
        if target_step != parsed.step {
            return Err(OnboardingError::malformed_token(
                &parsed.raw,
                format!("token issued for {} but called back on {}", parsed.step, target),
            ));
        }

        let body: CallbackBody = serde_json::from_slice(body)
            .map_err(|e| OnboardingError::malformed_event(format!("callback body: {}", e)))?;
        if let Some(caf_ref_no) = body.caf_ref_no.as_deref() {
            if caf_ref_no.trim() != parsed.business_ref {
                return Err(OnboardingError::malformed_token(
                    &parsed.raw,
                    format!("token does not belong to {}", caf_ref_no),
                ));
            }
        }
        body.ack_status.parse()
    }

    async fn dead_letter(&self, target: &str, token: &str, body: &[u8], err: &OnboardingError) {
        let payload = json!({
            "target": target,
            "token": token,
            "body": String::from_utf8_lossy(body),
        });
        let letter = DeadLetter {
            source: DeadLetterSource::Callback,
            reason: err.to_string(),
            payload: payload.to_string().into_bytes(),
            received_at: Utc::now(),
        };
        match self.dead_letters.put(letter).await {
            Ok(()) => tracing::warn!(
                target_step = target,
                error_kind = err.kind(),
                reason = %err,
                "Callback dead-lettered"
            ),
            Err(sink_err) => tracing::error!(
                target_step = target,
                error = %sink_err,
                reason = %err,
                "Dead-letter sink unavailable, callback lost"
            ),
        }
    }
}

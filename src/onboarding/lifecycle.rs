//! Process Lifecycle Manager: start, approve and signal engine instances.
//!
//! The business reference is the engine's business key; the surrogate record
//! id never crosses the boundary as a key. Engine calls run under a deadline.
//! After an ambiguous failure (timeout, dropped connection) the manager
//! re-queries the engine before deciding anything: a start that may have
//! landed is looked up, never re-issued blindly.

use std::future::Future;
use std::sync::Arc;

use serde_json::json;

use super::engine::{with_timeout, ProcessEngine};
use super::key_lock::KeyedLocks;
use super::store::CorrelationStore;
use super::types::{ApprovalDecision, EngineEvent, OnboardingRecord, RecordStatus, Variables};
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{EngineError, OnboardingError, OnboardingResult};

pub struct ProcessLifecycleManager {
    store: Arc<dyn CorrelationStore>,
    engine: Arc<dyn ProcessEngine>,
    locks: KeyedLocks,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl ProcessLifecycleManager {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        engine: Arc<dyn ProcessEngine>,
        locks: KeyedLocks,
        config: EngineConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            engine,
            locks,
            config,
            retry,
        }
    }

    // ── Start ──

    /// Start (or recover) the engine instance for `record` and bind it.
    ///
    /// Caller holds the record's key lock. Already-bound records return their
    /// instance without touching the engine.
    pub async fn start_instance(&self, record: &OnboardingRecord) -> OnboardingResult<String> {
        if let Some(bound) = &record.process_instance_id {
            return Ok(bound.clone());
        }
        let business_ref = record.business_ref.as_str();

        // An earlier attempt may have started the instance and lost the reply
        // or failed to record it.
        if let Some(existing) = self.find_active_instance(business_ref).await? {
            tracing::warn!(
                business_ref = business_ref,
                process_instance_id = %existing,
                "Found unbound process instance from an earlier attempt, binding it"
            );
            return self.bind(record, existing).await;
        }

        let variables = start_variables(record);
        let started = with_timeout(
            "start_instance",
            self.config.timeout(),
            self.engine
                .start_instance(&self.config.process_key, business_ref, &variables),
        )
        .await;

        match started {
            Ok(instance_id) => self.bind(record, instance_id).await,
            Err(e) if e.is_ambiguous() => {
                tracing::warn!(
                    business_ref = business_ref,
                    error = %e,
                    "Process start outcome unknown, re-querying engine"
                );
                match self.find_active_instance(business_ref).await {
                    Ok(Some(instance_id)) => self.bind(record, instance_id).await,
                    Ok(None) => Err(OnboardingError::OutcomeUnknown {
                        business_ref: business_ref.to_string(),
                        operation: "start_instance".to_string(),
                        message: e.to_string(),
                    }),
                    Err(query_err) => Err(OnboardingError::OutcomeUnknown {
                        business_ref: business_ref.to_string(),
                        operation: "start_instance".to_string(),
                        message: format!("{}; re-query failed: {}", e, query_err),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn bind(&self, record: &OnboardingRecord, instance_id: String) -> OnboardingResult<String> {
        let business_ref = record.business_ref.as_str();
        match self.store.bind_instance(business_ref, &instance_id).await {
            Ok(true) => {
                tracing::info!(
                    business_ref = business_ref,
                    process_instance_id = %instance_id,
                    "Process instance bound"
                );
                Ok(instance_id)
            }
            Ok(false) => {
                let current = self.store.find_by_ref(business_ref).await?.ok_or_else(|| {
                    OnboardingError::RecordNotFound {
                        business_ref: business_ref.to_string(),
                    }
                })?;
                match current.process_instance_id {
                    Some(bound) => {
                        if bound != instance_id {
                            tracing::error!(
                                business_ref = business_ref,
                                bound = %bound,
                                orphan = %instance_id,
                                reconciliation_candidate = true,
                                "Record already bound to a different instance"
                            );
                        }
                        Ok(bound)
                    }
                    None => Err(OnboardingError::Store(anyhow::anyhow!(
                        "bind of {} to {} affected no rows",
                        business_ref,
                        instance_id
                    ))),
                }
            }
            Err(e) => {
                // Starting twice is worse than one orphan: no automatic retry.
                tracing::error!(
                    business_ref = business_ref,
                    process_instance_id = %instance_id,
                    reconciliation_candidate = true,
                    error = %e,
                    "Process started but binding could not be recorded"
                );
                Err(OnboardingError::Store(e))
            }
        }
    }

    // ── Approval ──

    /// Forward a human decision to the pending approval task.
    pub async fn complete_task(
        &self,
        business_ref: &str,
        decision: &ApprovalDecision,
    ) -> OnboardingResult<RecordStatus> {
        let _guard = self.locks.lock(business_ref).await;
        let no_task = || OnboardingError::NoPendingTask {
            business_ref: business_ref.to_string(),
        };

        let record = self.store.find_by_ref(business_ref).await?.ok_or_else(no_task)?;
        if record.status != RecordStatus::AwaitingApproval {
            return Err(no_task());
        }

        let task_key = self.config.approval_task_key.as_str();
        let Some(task_id) = self
            .query("find_pending_task", || {
                self.engine.find_pending_task(business_ref, task_key)
            })
            .await?
        else {
            return self.recover_decision(business_ref).await?.ok_or_else(no_task);
        };

        let mut variables = Variables::new();
        variables.insert("approved".to_string(), json!(decision.approved));
        variables.insert("approvedBy".to_string(), json!(decision.user));
        variables.insert("cafRefNo".to_string(), json!(business_ref));

        self.complete_with_recheck(business_ref, &task_id, &variables)
            .await?;

        let status = if decision.approved {
            RecordStatus::Approved
        } else {
            RecordStatus::Rejected
        };
        self.store.update_status(business_ref, status).await?;

        tracing::info!(
            business_ref = business_ref,
            task_id = %task_id,
            approved = decision.approved,
            user = %decision.user,
            "Approval task completed"
        );
        Ok(status)
    }

    /// An approval task that closed while the record still awaits approval was
    /// completed by an earlier call whose status write was lost. Take the
    /// decision the engine recorded, not the one being retried.
    async fn recover_decision(&self, business_ref: &str) -> OnboardingResult<Option<RecordStatus>> {
        let task_key = self.config.approval_task_key.as_str();
        let finished = self
            .query("find_completed_task", || {
                self.engine.find_completed_task(business_ref, task_key)
            })
            .await?;
        let Some(approved) = finished.and_then(|vars| vars.get("approved").and_then(|v| v.as_bool()))
        else {
            return Ok(None);
        };

        let status = if approved {
            RecordStatus::Approved
        } else {
            RecordStatus::Rejected
        };
        self.store.update_status(business_ref, status).await?;
        tracing::info!(
            business_ref = business_ref,
            status = %status,
            "Approval already completed in engine, status recovered"
        );
        Ok(Some(status))
    }

    async fn complete_with_recheck(
        &self,
        business_ref: &str,
        task_id: &str,
        variables: &Variables,
    ) -> OnboardingResult<()> {
        let task_key = self.config.approval_task_key.as_str();
        let mut attempt = 1;
        loop {
            let result = with_timeout(
                "complete_task",
                self.config.timeout(),
                self.engine.complete_task(task_id, variables),
            )
            .await;

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e.into()),
            };

            if err.is_ambiguous() {
                // A task that is no longer open was completed by the lost call.
                match self
                    .query("find_pending_task", || {
                        self.engine.find_pending_task(business_ref, task_key)
                    })
                    .await
                {
                    Ok(Some(open)) if open == task_id => {}
                    Ok(_) => {
                        tracing::info!(
                            business_ref = business_ref,
                            task_id = task_id,
                            "Task closed after ambiguous completion, treating as completed"
                        );
                        return Ok(());
                    }
                    Err(query_err) => {
                        return Err(self.unknown(business_ref, "complete_task", &err, Some(query_err)))
                    }
                }
            }

            if attempt >= self.retry.max_attempts {
                return Err(if err.is_ambiguous() {
                    self.unknown(business_ref, "complete_task", &err, None)
                } else {
                    err.into()
                });
            }
            tracing::debug!(
                business_ref = business_ref,
                attempt = attempt,
                error = %err,
                "Retrying task completion"
            );
            tokio::time::sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    // ── Signals ──

    /// Forward a named signal to the instance bound to `business_ref`.
    pub async fn signal(
        &self,
        business_ref: &str,
        signal_name: &str,
        payload: &Variables,
    ) -> OnboardingResult<String> {
        let _guard = self.locks.lock(business_ref).await;
        self.signal_locked(business_ref, signal_name, payload).await
    }

    /// [`signal`](Self::signal) for callers already holding the key lock.
    pub(crate) async fn signal_locked(
        &self,
        business_ref: &str,
        signal_name: &str,
        payload: &Variables,
    ) -> OnboardingResult<String> {
        let unknown_instance = || OnboardingError::UnknownInstance {
            business_ref: business_ref.to_string(),
        };

        // Resolve fresh on every signal: the engine may have moved on since
        // the binding was written.
        let record = self
            .store
            .find_by_ref(business_ref)
            .await?
            .ok_or_else(unknown_instance)?;
        let bound = record.process_instance_id.ok_or_else(unknown_instance)?;

        match self.find_active_instance(business_ref).await? {
            Some(active) if active == bound => {}
            Some(active) => {
                tracing::warn!(
                    business_ref = business_ref,
                    bound = %bound,
                    active = %active,
                    "Active engine instance differs from bound instance"
                );
                return Err(unknown_instance());
            }
            None => return Err(unknown_instance()),
        }

        let mut attempt = 1;
        let mut prior_ambiguous = false;
        loop {
            let result = with_timeout(
                "signal_instance",
                self.config.timeout(),
                self.engine.signal_instance(&bound, signal_name, payload),
            )
            .await;

            let err = match result {
                Ok(()) => {
                    tracing::info!(
                        business_ref = business_ref,
                        process_instance_id = %bound,
                        signal = signal_name,
                        "Signal delivered"
                    );
                    return Ok(bound);
                }
                // The lost attempt consumed the subscription.
                Err(e) if prior_ambiguous && e.is_not_found() => {
                    tracing::info!(
                        business_ref = business_ref,
                        process_instance_id = %bound,
                        signal = signal_name,
                        "Signal subscription gone after ambiguous attempt, treating as delivered"
                    );
                    return Ok(bound);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e.into()),
            };
            prior_ambiguous |= err.is_ambiguous();

            if err.is_ambiguous() {
                match self.find_active_instance(business_ref).await {
                    Ok(Some(active)) if active == bound => {}
                    Ok(_) => {
                        tracing::info!(
                            business_ref = business_ref,
                            process_instance_id = %bound,
                            signal = signal_name,
                            "Instance ended after ambiguous signal, treating as delivered"
                        );
                        return Ok(bound);
                    }
                    Err(OnboardingError::Engine(query_err)) => {
                        return Err(self.unknown(business_ref, "signal_instance", &err, Some(query_err)))
                    }
                    Err(other) => return Err(other),
                }
            }

            if attempt >= self.retry.max_attempts {
                return Err(if err.is_ambiguous() {
                    self.unknown(business_ref, "signal_instance", &err, None)
                } else {
                    err.into()
                });
            }
            tracing::debug!(
                business_ref = business_ref,
                signal = signal_name,
                attempt = attempt,
                error = %err,
                "Retrying signal"
            );
            tokio::time::sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    // ── Engine lifecycle events ──

    /// Apply a lifecycle notification from the engine to the record status.
    pub async fn record_engine_event(
        &self,
        business_ref: &str,
        event: EngineEvent,
    ) -> OnboardingResult<RecordStatus> {
        let _guard = self.locks.lock(business_ref).await;
        let record = self.store.find_by_ref(business_ref).await?.ok_or_else(|| {
            OnboardingError::RecordNotFound {
                business_ref: business_ref.to_string(),
            }
        })?;

        if record.status.is_terminal() {
            tracing::debug!(
                business_ref = business_ref,
                status = %record.status,
                event = ?event,
                "Ignoring engine event for terminal record"
            );
            return Ok(record.status);
        }

        let next = match (event, record.status) {
            (EngineEvent::ApprovalTaskCreated, RecordStatus::Started) => {
                RecordStatus::AwaitingApproval
            }
            (EngineEvent::ApprovalTaskCreated, RecordStatus::AwaitingApproval) => {
                return Ok(RecordStatus::AwaitingApproval)
            }
            (EngineEvent::ApprovalTaskCreated, status) => {
                return Err(OnboardingError::InvalidTransition {
                    business_ref: business_ref.to_string(),
                    status,
                    operation: "open approval task".to_string(),
                })
            }
            (EngineEvent::ProcessCompleted, _) => RecordStatus::Completed,
            (EngineEvent::ProcessFailed, _) => RecordStatus::Failed,
        };

        self.store.update_status(business_ref, next).await?;
        tracing::info!(
            business_ref = business_ref,
            from = %record.status,
            to = %next,
            "Engine event applied"
        );
        Ok(next)
    }

    // ── Helpers ──

    async fn find_active_instance(&self, business_ref: &str) -> OnboardingResult<Option<String>> {
        Ok(self
            .query("find_instance", || self.engine.find_instance(business_ref))
            .await?)
    }

    /// Idempotent engine read with bounded retry.
    async fn query<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 1;
        loop {
            match with_timeout(operation, self.config.timeout(), call()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    tracing::debug!(
                        operation = operation,
                        attempt = attempt,
                        error = %e,
                        "Retrying engine query"
                    );
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unknown(
        &self,
        business_ref: &str,
        operation: &str,
        err: &EngineError,
        query_err: Option<EngineError>,
    ) -> OnboardingError {
        let message = match query_err {
            Some(q) => format!("{}; re-query failed: {}", err, q),
            None => format!("{} (retries exhausted)", err),
        };
        OnboardingError::OutcomeUnknown {
            business_ref: business_ref.to_string(),
            operation: operation.to_string(),
            message,
        }
    }
}

fn start_variables(record: &OnboardingRecord) -> Variables {
    let mut variables = Variables::new();
    variables.insert("cafRefNo".to_string(), json!(record.business_ref));
    variables.insert("recordId".to_string(), json!(record.id));
    variables.insert("zoneCode".to_string(), json!(record.zone_code));
    variables.insert("planCode".to_string(), json!(record.plan_code));
    variables.insert("isAgent".to_string(), json!(record.is_agent));
    if let Some(identity) = &record.permanent_identity {
        variables.insert("permanentIdentity".to_string(), json!(identity));
    }
    variables
}

//! Persistence contracts for the correlation engine.
//!
//! `CorrelationStore` is the only shared mutable resource. Callers mutate it
//! while holding the per-business-reference lock from `key_lock`; the store
//! itself only guarantees atomicity per call.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    ActivationStep, CorrelationToken, NewOnboardingRecord, OnboardingRecord, RecordStatus,
    TokenRecord,
};

/// Durable mapping from business reference to process instance and status.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    // ── Records ──

    async fn find_by_ref(&self, business_ref: &str) -> Result<Option<OnboardingRecord>>;

    /// Insert a record unless one already exists for the business reference.
    /// Returns whichever record is stored afterwards.
    async fn insert_if_absent(&self, record: &NewOnboardingRecord) -> Result<OnboardingRecord>;

    async fn update_status(&self, business_ref: &str, status: RecordStatus) -> Result<bool>;

    async fn set_permanent_identity(&self, business_ref: &str, identity: &str) -> Result<bool>;

    /// Bind the process instance and advance to `STARTED` in one write.
    ///
    /// Returns `false` without changing anything if the record is already
    /// bound: the binding is set at most once.
    async fn bind_instance(&self, business_ref: &str, process_instance_id: &str) -> Result<bool>;

    // ── Correlation tokens ──

    /// Record `token` as the outstanding token for its (step, business_ref),
    /// superseding any earlier one. Returns the superseded wire token.
    async fn put_token(&self, token: &CorrelationToken) -> Result<Option<String>>;

    async fn load_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> Result<Option<TokenRecord>>;

    /// Mark `token` consumed. Returns `false` if it is not the outstanding one.
    async fn consume_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
    ) -> Result<bool>;

    /// Consume `token` and write `status` in one atomic step.
    ///
    /// Returns `false` and writes nothing if `token` is not the outstanding
    /// one.
    async fn settle_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
        status: RecordStatus,
    ) -> Result<bool>;
}

/// Where a dead-lettered payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterSource {
    Ingestion,
    Callback,
}

impl DeadLetterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Callback => "callback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source: DeadLetterSource,
    pub reason: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Terminal sink for messages that must not be retried automatically.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn put(&self, letter: DeadLetter) -> Result<()>;
}

/// Row written for staging-routed activation steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRow {
    pub business_ref: String,
    pub step: ActivationStep,
    pub correlation_token: String,
    pub identity: Option<String>,
    pub plan_code: String,
    pub zone_code: String,
    pub created_at: DateTime<Utc>,
}

/// Intermediate table read by the telco side on the staging route.
#[async_trait]
pub trait StagingSink: Send + Sync {
    async fn insert(&self, row: &StagingRow) -> Result<()>;
}

//! In-memory implementations of the store and sink contracts.
//!
//! Used by the test suites and by single-process deployments without a
//! database.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::store::{CorrelationStore, DeadLetter, DeadLetterSink, StagingRow, StagingSink};
use super::types::{
    ActivationStep, CorrelationToken, NewOnboardingRecord, OnboardingRecord, RecordStatus,
    TokenRecord,
};

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, OnboardingRecord>,
    tokens: HashMap<(String, ActivationStep), TokenRecord>,
    next_id: i64,
}

/// Correlation store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryCorrelationStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, for assertions.
    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn find_by_ref(&self, business_ref: &str) -> Result<Option<OnboardingRecord>> {
        Ok(self.state.read().await.records.get(business_ref).cloned())
    }

    async fn insert_if_absent(&self, record: &NewOnboardingRecord) -> Result<OnboardingRecord> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.records.get(&record.business_ref) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let now = Utc::now();
        let stored = OnboardingRecord {
            id: state.next_id,
            business_ref: record.business_ref.clone(),
            zone_code: record.zone_code.clone(),
            plan_code: record.plan_code.clone(),
            identity_bearing: record.identity_bearing,
            permanent_identity: None,
            sim_identity: record.sim_identity.clone(),
            pos_hrno: record.pos_hrno.clone(),
            is_agent: record.is_agent,
            status: RecordStatus::New,
            process_instance_id: None,
            created_at: now,
            updated_at: now,
        };
        state
            .records
            .insert(record.business_ref.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_status(&self, business_ref: &str, status: RecordStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.records.get_mut(business_ref) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn set_permanent_identity(&self, business_ref: &str, identity: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.records.get_mut(business_ref) {
            Some(record) => {
                record.permanent_identity = Some(identity.to_string());
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn bind_instance(&self, business_ref: &str, process_instance_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.records.get_mut(business_ref) {
            Some(record) if record.process_instance_id.is_none() => {
                record.process_instance_id = Some(process_instance_id.to_string());
                record.status = RecordStatus::Started;
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn put_token(&self, token: &CorrelationToken) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        let previous = state.tokens.insert(
            (token.business_ref.clone(), token.step),
            TokenRecord {
                token: token.clone(),
                consumed_at: None,
            },
        );
        Ok(previous
            .filter(TokenRecord::is_outstanding)
            .map(|p| p.token.token))
    }

    async fn load_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> Result<Option<TokenRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tokens
            .get(&(business_ref.to_string(), step))
            .cloned())
    }

    async fn consume_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        Ok(match state.tokens.get_mut(&(business_ref.to_string(), step)) {
            Some(current) if current.is_outstanding() && current.token.token == token => {
                current.consumed_at = Some(Utc::now());
                true
            }
            _ => false,
        })
    }

    async fn settle_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
        status: RecordStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = (business_ref.to_string(), step);
        let outstanding = matches!(
            state.tokens.get(&key),
            Some(current) if current.is_outstanding() && current.token.token == token
        );
        if !outstanding || !state.records.contains_key(business_ref) {
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(current) = state.tokens.get_mut(&key) {
            current.consumed_at = Some(now);
        }
        if let Some(record) = state.records.get_mut(business_ref) {
            record.status = status;
            record.updated_at = now;
        }
        Ok(true)
    }
}

/// Dead-letter sink that keeps letters in memory.
#[derive(Clone, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn put(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            source = letter.source.as_str(),
            reason = %letter.reason,
            "Dead-lettered payload"
        );
        self.letters.write().await.push(letter);
        Ok(())
    }
}

/// Staging sink that keeps rows in memory.
#[derive(Clone, Default)]
pub struct MemoryStagingSink {
    rows: Arc<RwLock<Vec<StagingRow>>>,
}

impl MemoryStagingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<StagingRow> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl StagingSink for MemoryStagingSink {
    async fn insert(&self, row: &StagingRow) -> Result<()> {
        self.rows.write().await.push(row.clone());
        Ok(())
    }
}

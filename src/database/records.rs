//! PgCorrelationStore: onboarding records in `caf_onboarding_records`.
//!
//! Runtime-checked queries so the crate builds without a live database.
//! Every write is a single statement; serialization per business reference is
//! the caller's key lock, not a row lock held across calls.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::tokens;
use crate::onboarding::store::CorrelationStore;
use crate::onboarding::types::{
    ActivationStep, CorrelationToken, NewOnboardingRecord, OnboardingRecord, RecordStatus,
    TokenRecord,
};

const RECORD_COLUMNS: &str = "id, business_ref, zone_code, plan_code, identity_bearing, \
     permanent_identity, sim_identity, pos_hrno, is_agent, status, process_instance_id, \
     created_at, updated_at";

/// Postgres-backed correlation store.
#[derive(Clone)]
pub struct PgCorrelationStore {
    pool: PgPool,
}

impl PgCorrelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> Result<OnboardingRecord> {
    let status: String = row.try_get("status")?;
    Ok(OnboardingRecord {
        id: row.try_get("id")?,
        business_ref: row.try_get("business_ref")?,
        zone_code: row.try_get("zone_code")?,
        plan_code: row.try_get("plan_code")?,
        identity_bearing: row.try_get("identity_bearing")?,
        permanent_identity: row.try_get("permanent_identity")?,
        sim_identity: row.try_get("sim_identity")?,
        pos_hrno: row.try_get("pos_hrno")?,
        is_agent: row.try_get("is_agent")?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown record status '{}'", status))?,
        process_instance_id: row.try_get("process_instance_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl CorrelationStore for PgCorrelationStore {
    async fn find_by_ref(&self, business_ref: &str) -> Result<Option<OnboardingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM caf_onboarding_records WHERE business_ref = $1",
            RECORD_COLUMNS
        ))
        .bind(business_ref)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query onboarding record by business_ref")?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn insert_if_absent(&self, record: &NewOnboardingRecord) -> Result<OnboardingRecord> {
        sqlx::query(
            r#"
            INSERT INTO caf_onboarding_records
                (business_ref, zone_code, plan_code, identity_bearing,
                 sim_identity, pos_hrno, is_agent, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (business_ref) DO NOTHING
            "#,
        )
        .bind(&record.business_ref)
        .bind(&record.zone_code)
        .bind(&record.plan_code)
        .bind(record.identity_bearing)
        .bind(record.sim_identity.as_deref())
        .bind(record.pos_hrno.as_deref())
        .bind(record.is_agent)
        .bind(RecordStatus::New.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert onboarding record")?;

        self.find_by_ref(&record.business_ref)
            .await?
            .ok_or_else(|| anyhow!("Record {} missing after insert", record.business_ref))
    }

    async fn update_status(&self, business_ref: &str, status: RecordStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE caf_onboarding_records
            SET status = $2, updated_at = now()
            WHERE business_ref = $1
            "#,
        )
        .bind(business_ref)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update onboarding record status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_permanent_identity(&self, business_ref: &str, identity: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE caf_onboarding_records
            SET permanent_identity = $2, updated_at = now()
            WHERE business_ref = $1
            "#,
        )
        .bind(business_ref)
        .bind(identity)
        .execute(&self.pool)
        .await
        .context("Failed to set permanent identity")?;
        Ok(result.rows_affected() > 0)
    }

    async fn bind_instance(&self, business_ref: &str, process_instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE caf_onboarding_records
            SET process_instance_id = $2, status = $3, updated_at = now()
            WHERE business_ref = $1 AND process_instance_id IS NULL
            "#,
        )
        .bind(business_ref)
        .bind(process_instance_id)
        .bind(RecordStatus::Started.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to bind process instance")?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_token(&self, token: &CorrelationToken) -> Result<Option<String>> {
        tokens::put_token(&self.pool, token).await
    }

    async fn load_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
    ) -> Result<Option<TokenRecord>> {
        tokens::load_token(&self.pool, business_ref, step).await
    }

    async fn consume_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
    ) -> Result<bool> {
        tokens::consume_token(&self.pool, business_ref, step, token).await
    }

    async fn settle_token(
        &self,
        business_ref: &str,
        step: ActivationStep,
        token: &str,
        status: RecordStatus,
    ) -> Result<bool> {
        tokens::settle_token(&self.pool, business_ref, step, token, status).await
    }
}

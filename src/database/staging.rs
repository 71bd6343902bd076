//! Staging route sink: rows in `telco_staging` picked up by the telco side.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::onboarding::store::{StagingRow, StagingSink};

#[derive(Clone)]
pub struct PgStagingSink {
    pool: PgPool,
}

impl PgStagingSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingSink for PgStagingSink {
    async fn insert(&self, row: &StagingRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO telco_staging
                (business_ref, step, correlation_token, identity, plan_code, zone_code, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&row.business_ref)
        .bind(row.step.as_str())
        .bind(&row.correlation_token)
        .bind(row.identity.as_deref())
        .bind(&row.plan_code)
        .bind(&row.zone_code)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to insert staging row for {} {}",
                row.business_ref, row.step
            )
        })?;
        Ok(())
    }
}

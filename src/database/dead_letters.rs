//! Dead-letter sink backed by `caf_dead_letters`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::onboarding::store::{DeadLetter, DeadLetterSink};

#[derive(Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count of dead letters from `source`, for operators and tests.
    pub async fn count_by_source(&self, source: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM caf_dead_letters WHERE source = $1")
            .bind(source)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count dead letters")?;
        Ok(row.try_get("count")?)
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn put(&self, letter: DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO caf_dead_letters (source, reason, payload, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(letter.source.as_str())
        .bind(&letter.reason)
        .bind(&letter.payload)
        .bind(letter.received_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert dead letter")?;
        Ok(())
    }
}

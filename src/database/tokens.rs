//! Correlation token rows in `caf_correlation_tokens`.
//!
//! One row per (business_ref, step). Re-issuing overwrites the row, which is
//! what invalidates the earlier token.

use anyhow::{anyhow, Context, Result};
use sqlx::{PgPool, Row};

use crate::onboarding::types::{ActivationStep, CorrelationToken, RecordStatus, TokenRecord};

pub(super) async fn put_token(pool: &PgPool, token: &CorrelationToken) -> Result<Option<String>> {
    let mut tx = pool.begin().await.context("Failed to begin token transaction")?;

    let superseded: Option<String> = sqlx::query(
        r#"
        SELECT token FROM caf_correlation_tokens
        WHERE business_ref = $1 AND step = $2 AND consumed_at IS NULL
        FOR UPDATE
        "#,
    )
    .bind(&token.business_ref)
    .bind(token.step.as_str())
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to query outstanding token")?
    .map(|row| row.try_get("token"))
    .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO caf_correlation_tokens (business_ref, step, token, issued_at, consumed_at)
        VALUES ($1, $2, $3, $4, NULL)
        ON CONFLICT (business_ref, step) DO UPDATE
        SET token = EXCLUDED.token, issued_at = EXCLUDED.issued_at, consumed_at = NULL
        "#,
    )
    .bind(&token.business_ref)
    .bind(token.step.as_str())
    .bind(&token.token)
    .bind(token.issued_at)
    .execute(&mut *tx)
    .await
    .context("Failed to upsert correlation token")?;

    tx.commit().await.context("Failed to commit token")?;
    Ok(superseded)
}

pub(super) async fn load_token(
    pool: &PgPool,
    business_ref: &str,
    step: ActivationStep,
) -> Result<Option<TokenRecord>> {
    let row = sqlx::query(
        r#"
        SELECT business_ref, step, token, issued_at, consumed_at
        FROM caf_correlation_tokens
        WHERE business_ref = $1 AND step = $2
        "#,
    )
    .bind(business_ref)
    .bind(step.as_str())
    .fetch_optional(pool)
    .await
    .context("Failed to load correlation token")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let step_text: String = row.try_get("step")?;
    Ok(Some(TokenRecord {
        token: CorrelationToken {
            step: ActivationStep::parse(&step_text)
                .ok_or_else(|| anyhow!("Unknown activation step '{}'", step_text))?,
            business_ref: row.try_get("business_ref")?,
            issued_at: row.try_get("issued_at")?,
            token: row.try_get("token")?,
        },
        consumed_at: row.try_get("consumed_at")?,
    }))
}

pub(super) async fn consume_token(
    pool: &PgPool,
    business_ref: &str,
    step: ActivationStep,
    token: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE caf_correlation_tokens
        SET consumed_at = now()
        WHERE business_ref = $1 AND step = $2 AND token = $3 AND consumed_at IS NULL
        "#,
    )
    .bind(business_ref)
    .bind(step.as_str())
    .bind(token)
    .execute(pool)
    .await
    .context("Failed to consume correlation token")?;
    Ok(result.rows_affected() > 0)
}

/// Consume the token and advance the record in one transaction.
pub(super) async fn settle_token(
    pool: &PgPool,
    business_ref: &str,
    step: ActivationStep,
    token: &str,
    status: RecordStatus,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("Failed to begin settle transaction")?;

    let consumed = sqlx::query(
        r#"
        UPDATE caf_correlation_tokens
        SET consumed_at = now()
        WHERE business_ref = $1 AND step = $2 AND token = $3 AND consumed_at IS NULL
        "#,
    )
    .bind(business_ref)
    .bind(step.as_str())
    .bind(token)
    .execute(&mut *tx)
    .await
    .context("Failed to consume correlation token")?;
    if consumed.rows_affected() == 0 {
        tx.rollback().await.context("Failed to roll back settle")?;
        return Ok(false);
    }

    let updated = sqlx::query(
        r#"
        UPDATE caf_onboarding_records
        SET status = $2, updated_at = now()
        WHERE business_ref = $1
        "#,
    )
    .bind(business_ref)
    .bind(status.to_string())
    .execute(&mut *tx)
    .await
    .context("Failed to update onboarding record status")?;
    if updated.rows_affected() == 0 {
        tx.rollback().await.context("Failed to roll back settle")?;
        return Ok(false);
    }

    tx.commit().await.context("Failed to commit settle")?;
    Ok(true)
}

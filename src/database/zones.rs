//! Zone routing rows in `zone_configs` (administered outside this service).

use anyhow::{anyhow, Context, Result};
use sqlx::{PgPool, Row};

use crate::onboarding::types::{RouteMode, ZoneConfig};

fn mode(row: &sqlx::postgres::PgRow, column: &str) -> Result<RouteMode> {
    let value: String = row.try_get(column)?;
    RouteMode::parse(&value).ok_or_else(|| anyhow!("Invalid {} '{}'", column, value))
}

/// Read every zone configuration.
pub async fn load_zone_configs(pool: &PgPool) -> Result<Vec<ZoneConfig>> {
    let rows = sqlx::query(
        r#"
        SELECT zone_code, preact_mode, tv_mode, finalact_mode, commission_mode
        FROM zone_configs
        ORDER BY zone_code
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to load zone configs")?;

    rows.iter()
        .map(|row| {
            Ok(ZoneConfig {
                zone_code: row.try_get("zone_code")?,
                preact_mode: mode(row, "preact_mode")?,
                tv_mode: mode(row, "tv_mode")?,
                finalact_mode: mode(row, "finalact_mode")?,
                commission_mode: mode(row, "commission_mode")?,
            })
        })
        .collect()
}

/// Insert or replace one zone. Used for seeding from configuration.
pub async fn upsert_zone_config(pool: &PgPool, zone: &ZoneConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO zone_configs (zone_code, preact_mode, tv_mode, finalact_mode, commission_mode)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (zone_code) DO UPDATE
        SET preact_mode = EXCLUDED.preact_mode,
            tv_mode = EXCLUDED.tv_mode,
            finalact_mode = EXCLUDED.finalact_mode,
            commission_mode = EXCLUDED.commission_mode
        "#,
    )
    .bind(&zone.zone_code)
    .bind(zone.preact_mode.as_str())
    .bind(zone.tv_mode.as_str())
    .bind(zone.finalact_mode.as_str())
    .bind(zone.commission_mode.as_str())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to upsert zone config {}", zone.zone_code))?;
    Ok(())
}

//! Database connection management and Postgres-backed stores.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};

pub mod dead_letters;
pub mod records;
pub mod staging;
pub mod tokens;
pub mod zones;

pub use dead_letters::PgDeadLetterSink;
pub use records::PgCorrelationStore;
pub use staging::PgStagingSink;
pub use zones::{load_zone_configs, upsert_zone_config};

/// Postgres pool settings, read from the environment.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    /// `DATABASE_URL`, `CAF_DB_POOL_SIZE` and `CAF_DB_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let number = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/caf_onboarding".to_string()),
            max_connections: number("CAF_DB_POOL_SIZE")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(number("CAF_DB_ACQUIRE_TIMEOUT_SECS").unwrap_or(5)),
        }
    }
}

/// Owns the pool and hands out the store and sink adapters.
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            url = %mask_database_url(&config.database_url),
            max_connections = config.max_connections,
            "Connecting to correlation database"
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .inspect_err(|e| warn!(error = %e, "Correlation database unreachable"))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn correlation_store(&self) -> PgCorrelationStore {
        PgCorrelationStore::new(self.pool.clone())
    }

    pub fn dead_letter_sink(&self) -> PgDeadLetterSink {
        PgDeadLetterSink::new(self.pool.clone())
    }

    pub fn staging_sink(&self) -> PgStagingSink {
        PgStagingSink::new(self.pool.clone())
    }

    /// Apply the bundled schema migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Hide the password before a URL reaches the logs.
fn mask_database_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => {
            // Unparseable: keep only the scheme, if there is one.
            match url.split_once("://") {
                Some((scheme, _)) if scheme.chars().all(|c| c.is_ascii_alphanumeric()) => {
                    format!("{}://***", scheme)
                }
                _ => "***".to_string(),
            }
        }
    }
}

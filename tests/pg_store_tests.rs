//! Postgres correlation store tests
//!
//! Requires a live database:
//!   DATABASE_URL=postgresql://localhost:5432/caf_onboarding \
//!     cargo test --test pg_store_tests -- --ignored

#![cfg(feature = "database")]

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use caf_onboarding::database::{load_zone_configs, upsert_zone_config, PgCorrelationStore};
use caf_onboarding::onboarding::tokens::encode_token;
use caf_onboarding::onboarding::{
    ActivationStep, CorrelationStore, CorrelationToken, NewOnboardingRecord, RecordStatus,
    RouteMode, ZoneConfig,
};

async fn get_test_pool() -> PgPool {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

async fn cleanup(pool: &PgPool, business_ref: &str) {
    sqlx::query("DELETE FROM caf_correlation_tokens WHERE business_ref = $1")
        .bind(business_ref)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM caf_onboarding_records WHERE business_ref = $1")
        .bind(business_ref)
        .execute(pool)
        .await
        .ok();
}

fn new_record(business_ref: &str) -> NewOnboardingRecord {
    NewOnboardingRecord {
        business_ref: business_ref.to_string(),
        zone_code: "Z1".to_string(),
        plan_code: "USIM-PREMIUM".to_string(),
        identity_bearing: true,
        sim_identity: None,
        pos_hrno: Some("POS-7".to_string()),
        is_agent: false,
    }
}

fn token(step: ActivationStep, business_ref: &str) -> CorrelationToken {
    CorrelationToken {
        step,
        business_ref: business_ref.to_string(),
        issued_at: Utc::now(),
        token: encode_token(step, business_ref, Uuid::new_v4()),
    }
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
async fn test_insert_if_absent_and_bind_once() {
    let pool = get_test_pool().await;
    let store = PgCorrelationStore::new(pool.clone());
    let business_ref = format!("CAF-PG-{}", Uuid::new_v4().simple());

    let first = store.insert_if_absent(&new_record(&business_ref)).await.unwrap();
    let second = store.insert_if_absent(&new_record(&business_ref)).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.status, RecordStatus::New);

    assert!(store.bind_instance(&business_ref, "pi-1").await.unwrap());
    assert!(!store.bind_instance(&business_ref, "pi-2").await.unwrap());

    let record = store.find_by_ref(&business_ref).await.unwrap().unwrap();
    assert_eq!(record.process_instance_id.as_deref(), Some("pi-1"));
    assert_eq!(record.status, RecordStatus::Started);

    assert!(store
        .update_status(&business_ref, RecordStatus::StepPending(ActivationStep::Tv))
        .await
        .unwrap());
    let record = store.find_by_ref(&business_ref).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::StepPending(ActivationStep::Tv));

    cleanup(&pool, &business_ref).await;
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
async fn test_token_supersede_and_consume() {
    let pool = get_test_pool().await;
    let store = PgCorrelationStore::new(pool.clone());
    let business_ref = format!("CAF-PG-{}", Uuid::new_v4().simple());
    store.insert_if_absent(&new_record(&business_ref)).await.unwrap();

    let first = token(ActivationStep::PreActivation, &business_ref);
    assert_eq!(store.put_token(&first).await.unwrap(), None);

    let second = token(ActivationStep::PreActivation, &business_ref);
    assert_eq!(
        store.put_token(&second).await.unwrap(),
        Some(first.token.clone())
    );

    let current = store
        .load_token(&business_ref, ActivationStep::PreActivation)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.token.token, second.token);
    assert!(current.is_outstanding());

    // Consuming the superseded token is a no-op.
    assert!(!store
        .consume_token(&business_ref, ActivationStep::PreActivation, &first.token)
        .await
        .unwrap());
    assert!(store
        .consume_token(&business_ref, ActivationStep::PreActivation, &second.token)
        .await
        .unwrap());
    assert!(!store
        .consume_token(&business_ref, ActivationStep::PreActivation, &second.token)
        .await
        .unwrap());

    cleanup(&pool, &business_ref).await;
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
async fn test_zone_config_upsert_round() {
    let pool = get_test_pool().await;
    let zone_code = format!("ZT-{}", Uuid::new_v4().simple());
    let zone = ZoneConfig {
        zone_code: zone_code.clone(),
        preact_mode: RouteMode::Api,
        tv_mode: RouteMode::Staging,
        finalact_mode: RouteMode::Api,
        commission_mode: RouteMode::Staging,
    };

    upsert_zone_config(&pool, &zone).await.unwrap();
    let updated = ZoneConfig {
        tv_mode: RouteMode::Api,
        ..zone.clone()
    };
    upsert_zone_config(&pool, &updated).await.unwrap();

    let zones = load_zone_configs(&pool).await.unwrap();
    let loaded = zones.iter().find(|z| z.zone_code == zone_code).unwrap();
    assert_eq!(loaded, &updated);

    sqlx::query("DELETE FROM zone_configs WHERE zone_code = $1")
        .bind(&zone_code)
        .execute(&pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore = "Requires DATABASE_URL"]
async fn test_settle_token_consumes_and_advances_together() {
    let pool = get_test_pool().await;
    let store = PgCorrelationStore::new(pool.clone());
    let business_ref = format!("CAF-PG-{}", Uuid::new_v4().simple());
    store.insert_if_absent(&new_record(&business_ref)).await.unwrap();

    let issued = token(ActivationStep::Tv, &business_ref);
    store.put_token(&issued).await.unwrap();
    let acked = RecordStatus::StepAcked(ActivationStep::Tv);

    // A foreign token changes nothing.
    assert!(!store
        .settle_token(&business_ref, ActivationStep::Tv, "TV.00.00", acked)
        .await
        .unwrap());
    let record = store.find_by_ref(&business_ref).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::New);

    assert!(store
        .settle_token(&business_ref, ActivationStep::Tv, &issued.token, acked)
        .await
        .unwrap());
    let record = store.find_by_ref(&business_ref).await.unwrap().unwrap();
    assert_eq!(record.status, acked);
    let current = store
        .load_token(&business_ref, ActivationStep::Tv)
        .await
        .unwrap()
        .unwrap();
    assert!(!current.is_outstanding());

    cleanup(&pool, &business_ref).await;
}

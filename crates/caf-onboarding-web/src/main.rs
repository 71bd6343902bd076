//! CAF Onboarding Web Server
//!
//! Wires the onboarding engine to Postgres, Flowable and the activation
//! backends, runs the ingestion lanes, and serves the callback/approval API.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use caf_onboarding::api::{onboarding_router, OnboardingApiState};
use caf_onboarding::clients::{FlowableClient, HttpActivationApi, HttpIdentityProvisioner};
use caf_onboarding::config::OnboardingConfig;
use caf_onboarding::database::{
    load_zone_configs, upsert_zone_config, DatabaseConfig, DatabaseManager,
};
use caf_onboarding::onboarding::ingestion::partitioned_channels;
use caf_onboarding::onboarding::{OnboardingDeps, OnboardingServices, ZoneRoutingTable};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "caf_onboarding=info,caf_onboarding_web=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CAF Onboarding Server");

    let config = OnboardingConfig::load()?;

    // Database connection
    let db = match DatabaseManager::connect(&DatabaseConfig::from_env()).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            tracing::error!(
                "Please check DATABASE_URL environment variable and ensure PostgreSQL is running"
            );
            return Err(format!("Database connection failed: {}", e).into());
        }
    };
    db.run_migrations().await?;

    // Zone routing: database rows win; the config list seeds an empty table.
    let mut zones = load_zone_configs(db.pool()).await?;
    if zones.is_empty() && !config.zones.is_empty() {
        tracing::info!(count = config.zones.len(), "Seeding zone configs from configuration");
        for zone in &config.zones {
            upsert_zone_config(db.pool(), zone).await?;
        }
        zones = config.zones.clone();
    }
    let routing = ZoneRoutingTable::from_configs(zones);
    if routing.zone_count() == 0 {
        tracing::warn!("No zone routing configured; every dispatch will fail with UnconfiguredZone");
    }

    let services = OnboardingServices::new(
        OnboardingDeps {
            store: Arc::new(db.correlation_store()),
            engine: Arc::new(FlowableClient::new(&config.engine)?),
            provisioner: Arc::new(HttpIdentityProvisioner::new(&config.provisioner)?),
            activation_api: Arc::new(HttpActivationApi::new(&config.activation)?),
            staging: Arc::new(db.staging_sink()),
            dead_letters: Arc::new(db.dead_letter_sink()),
            routing,
        },
        &config,
    );

    // =========================================================================
    // Ingestion lanes
    // =========================================================================
    let (publisher, sources) = partitioned_channels(
        config.ingestion.lanes,
        config.ingestion.channel_capacity,
        config.ingestion.redelivery_backoff(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = services.ingestion_worker().spawn(sources, shutdown_rx);
    tracing::info!(lanes = workers.len(), "Ingestion workers started");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = onboarding_router(OnboardingApiState::new(services, Some(publisher))).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(format!("Bind failed: {}", e).into());
        }
    };
    tracing::info!("Server listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    });
    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
        return Err(format!("Server error: {}", e).into());
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Ingestion worker ended abnormally: {}", e);
        }
    }
    db.close().await;
    tracing::info!("CAF Onboarding Server stopped");
    Ok(())
}

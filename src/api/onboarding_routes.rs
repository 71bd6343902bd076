//! CAF Onboarding API Routes
//!
//! Endpoints for:
//! - Event ingress (`POST /events/caf`)
//! - Human approval (`POST /caf/:caf_ref/approve`)
//! - Step dispatch and manual retry, called by the engine's service tasks
//! - Engine lifecycle events (`POST /engine/events`)
//! - Activation callbacks (`POST /callback/:target/:corr`)
//! - Record inspection and health

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::OnboardingError;
use crate::onboarding::ingestion::{IngestOutcome, PartitionedPublisher};
use crate::onboarding::signal_dispatcher::CallbackOutcome;
use crate::onboarding::store::{DeadLetter, DeadLetterSink, DeadLetterSource};
use crate::onboarding::types::{ActivationStep, ApprovalDecision, EngineEvent};
use crate::onboarding::OnboardingServices;

// =============================================================================
// STATE
// =============================================================================

/// Shared state for onboarding routes
#[derive(Clone)]
pub struct OnboardingApiState {
    pub services: OnboardingServices,
    /// Queue ingress. Without one, `/events/caf` ingests inline.
    pub publisher: Option<PartitionedPublisher>,
}

impl OnboardingApiState {
    pub fn new(services: OnboardingServices, publisher: Option<PartitionedPublisher>) -> Self {
        Self {
            services,
            publisher,
        }
    }
}

// =============================================================================
// ROUTER
// =============================================================================

/// Create the onboarding API router
pub fn onboarding_router(state: OnboardingApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events/caf", post(ingest_event))
        .route("/caf/:caf_ref", get(get_record))
        .route("/caf/:caf_ref/approve", post(approve))
        .route("/caf/:caf_ref/steps/:step/dispatch", post(dispatch_step))
        .route("/caf/:caf_ref/steps/:step/retry", post(retry_step))
        .route("/engine/events", post(engine_event))
        .route("/callback/:target/:corr", post(callback))
        .with_state(state)
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error surfaced by a route handler.
#[derive(Debug)]
pub enum ApiError {
    Onboarding(OnboardingError),
    BadRequest(String),
    Unavailable(String),
}

impl From<OnboardingError> for ApiError {
    fn from(e: OnboardingError) -> Self {
        Self::Onboarding(e)
    }
}

/// HTTP status for each error kind.
pub fn status_for(err: &OnboardingError) -> StatusCode {
    match err {
        OnboardingError::MalformedEvent { .. } | OnboardingError::MalformedToken { .. } => {
            StatusCode::BAD_REQUEST
        }
        OnboardingError::NoPendingTask { .. }
        | OnboardingError::UnknownInstance { .. }
        | OnboardingError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
        OnboardingError::UnconfiguredZone { .. } | OnboardingError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        OnboardingError::StaleToken { .. } => StatusCode::OK,
        OnboardingError::ProvisioningError { .. }
        | OnboardingError::OutcomeUnknown { .. }
        | OnboardingError::Engine(_)
        | OnboardingError::Activation(_) => StatusCode::BAD_GATEWAY,
        OnboardingError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Onboarding(e) => {
                let status = status_for(&e);
                if status.is_server_error() {
                    tracing::error!(error_kind = e.kind(), error = %e, "Request failed");
                }
                (status, e.kind(), e.to_string())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
        };
        (status, Json(json!({ "message": message, "error": kind }))).into_response()
    }
}

fn parse_step(raw: &str) -> Result<ActivationStep, ApiError> {
    ActivationStep::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("unknown step '{}'", raw)))
}

/// Decode a JSON body into the uniform error shape instead of axum's rejection.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {}", e)))
}

// =============================================================================
// REQUEST / RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEventRequest {
    pub business_key: String,
    pub event: EngineEvent,
}

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub message: String,
    pub status: String,
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn ingest_event(
    State(state): State<OnboardingApiState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(publisher) = &state.publisher {
        publisher
            .publish_raw(body.to_vec())
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;
        return Ok((StatusCode::ACCEPTED, Json(json!({ "message": "queued" }))).into_response());
    }

    let outcome = match state.services.gate.ingest(&body).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_dead_letter() => {
            // Inline ingestion mirrors the queue path: malformed input is kept.
            let letter = DeadLetter {
                source: DeadLetterSource::Ingestion,
                reason: e.to_string(),
                payload: body.to_vec(),
                received_at: Utc::now(),
            };
            if let Err(sink_err) = state.services.dead_letters.put(letter).await {
                tracing::error!(error = %sink_err, "Failed to dead-letter inline event");
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let body = match outcome {
        IngestOutcome::Started {
            business_ref,
            process_instance_id,
        } => json!({
            "message": "started",
            "cafRefNo": business_ref,
            "processInstanceId": process_instance_id,
        }),
        IngestOutcome::Duplicate {
            business_ref,
            process_instance_id,
        } => json!({
            "message": "duplicate",
            "cafRefNo": business_ref,
            "processInstanceId": process_instance_id,
        }),
    };
    Ok((StatusCode::OK, Json(body)).into_response())
}

async fn get_record(
    State(state): State<OnboardingApiState>,
    Path(caf_ref): Path<String>,
) -> Result<Response, ApiError> {
    let record = state.services.find_record(&caf_ref).await?;
    Ok(Json(record).into_response())
}

async fn approve(
    State(state): State<OnboardingApiState>,
    Path(caf_ref): Path<String>,
    body: Bytes,
) -> Result<Json<StatusMessage>, ApiError> {
    let decision: ApprovalDecision = parse_body(&body)?;
    let status = state
        .services
        .lifecycle
        .complete_task(&caf_ref, &decision)
        .await?;
    Ok(Json(StatusMessage {
        message: format!("CAF {} decision recorded by {}", caf_ref, decision.user),
        status: status.to_string(),
    }))
}

async fn dispatch_step(
    State(state): State<OnboardingApiState>,
    Path((caf_ref, step)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let step = parse_step(&step)?;
    let receipt = state
        .services
        .activation
        .dispatch_step(&caf_ref, step)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn retry_step(
    State(state): State<OnboardingApiState>,
    Path((caf_ref, step)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let step = parse_step(&step)?;
    let receipt = state.services.activation.retry_step(&caf_ref, step).await?;
    Ok(Json(receipt).into_response())
}

async fn engine_event(
    State(state): State<OnboardingApiState>,
    body: Bytes,
) -> Result<Json<StatusMessage>, ApiError> {
    let req: EngineEventRequest = parse_body(&body)?;
    let status = state
        .services
        .lifecycle
        .record_engine_event(&req.business_key, req.event)
        .await?;
    Ok(Json(StatusMessage {
        message: format!("event applied to {}", req.business_key),
        status: status.to_string(),
    }))
}

async fn callback(
    State(state): State<OnboardingApiState>,
    Path((target, corr)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let outcome = state
        .services
        .signals
        .handle_callback(&target, &corr, &body)
        .await?;
    let message = match &outcome {
        CallbackOutcome::Applied { .. } => "acknowledged",
        CallbackOutcome::Discarded { .. } => "duplicate discarded",
    };
    Ok((
        StatusCode::OK,
        Json(json!({ "message": message, "result": outcome })),
    )
        .into_response())
}

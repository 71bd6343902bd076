//! Error taxonomy for the onboarding correlation engine
//!
//! Every failure the engine can produce is one of these variants. The
//! classification helpers decide what the transport layer does with it:
//! dead-letter, redeliver, report to the operator, or acknowledge and drop.

use thiserror::Error;

use crate::onboarding::types::{ActivationStep, RecordStatus};

/// Main error type for onboarding operations
#[derive(Error, Debug)]
pub enum OnboardingError {
    /// Inbound payload could not be parsed into a CAF event.
    #[error("Malformed event: {reason}")]
    MalformedEvent { reason: String },

    /// Callback token could not be parsed or refers to a step never issued.
    #[error("Malformed correlation token '{token}': {reason}")]
    MalformedToken { token: String, reason: String },

    /// Identity provisioning failed; a redelivery will try again.
    #[error("Identity provisioning failed for {business_ref}: {message}")]
    ProvisioningError {
        business_ref: String,
        message: String,
    },

    /// Zone has no routing configuration.
    #[error("Zone '{zone_code}' has no routing configuration")]
    UnconfiguredZone { zone_code: String },

    /// Callback carried a token that is no longer outstanding.
    #[error("Stale correlation token for {step} of {business_ref}")]
    StaleToken {
        business_ref: String,
        step: ActivationStep,
    },

    #[error("No pending approval task for {business_ref}")]
    NoPendingTask { business_ref: String },

    #[error("No active process instance for {business_ref}")]
    UnknownInstance { business_ref: String },

    #[error("Onboarding record {business_ref} not found")]
    RecordNotFound { business_ref: String },

    /// Requested operation is not valid from the record's current status.
    #[error("Cannot {operation} for {business_ref} in status {status}")]
    InvalidTransition {
        business_ref: String,
        status: RecordStatus,
        operation: String,
    },

    /// A remote call timed out or dropped mid-flight and re-querying the
    /// remote state did not settle whether it took effect.
    #[error("Outcome of {operation} for {business_ref} is unknown: {message}")]
    OutcomeUnknown {
        business_ref: String,
        operation: String,
        message: String,
    },

    /// The process engine definitively rejected a request.
    #[error("Process engine error: {0}")]
    Engine(#[from] EngineError),

    /// Outbound activation request failed.
    #[error("Activation request failed: {0}")]
    Activation(#[from] ActivationError),

    /// Persistence failure in the correlation store or a sink.
    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl OnboardingError {
    /// Failures that must go to the dead-letter sink and never be retried.
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::MalformedEvent { .. } | Self::MalformedToken { .. })
    }

    /// Failures a queue redelivery or HTTP retry may resolve.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProvisioningError { .. } | Self::OutcomeUnknown { .. } | Self::Store(_) => true,
            Self::Engine(e) => e.is_retryable(),
            Self::Activation(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Benign duplicates: success with no new effect.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::StaleToken { .. })
    }

    /// Short machine-readable kind, used in HTTP bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent { .. } => "malformed_event",
            Self::MalformedToken { .. } => "malformed_token",
            Self::ProvisioningError { .. } => "provisioning_error",
            Self::UnconfiguredZone { .. } => "unconfigured_zone",
            Self::StaleToken { .. } => "stale_token",
            Self::NoPendingTask { .. } => "no_pending_task",
            Self::UnknownInstance { .. } => "unknown_instance",
            Self::RecordNotFound { .. } => "record_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::OutcomeUnknown { .. } => "outcome_unknown",
            Self::Engine(_) => "engine_error",
            Self::Activation(_) => "activation_error",
            Self::Store(_) => "store_error",
        }
    }

    pub(crate) fn malformed_event(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_token(token: &str, reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from the external process engine adapter
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Call exceeded its deadline; the engine may or may not have applied it.
    #[error("engine call '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Connection dropped after the request was sent.
    #[error("engine transport failure: {0}")]
    Transport(String),

    /// Request never reached the engine.
    #[error("engine unreachable: {0}")]
    Unreachable(String),

    /// Engine answered with a non-success status.
    #[error("engine rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("could not decode engine response: {0}")]
    Decode(String),
}

impl EngineError {
    /// The remote side may have applied the request.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::Unreachable(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }

    /// The target (instance, task, subscription) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { status: 404, .. })
    }
}

/// Errors from the identity provisioning adapter
#[derive(Error, Debug, Clone)]
pub enum ProvisionError {
    #[error("provisioning timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("provisioning transport failure: {0}")]
    Transport(String),

    #[error("provisioning rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("provisioning returned no identity")]
    Empty,
}

/// Errors from the synchronous activation API adapter
#[derive(Error, Debug, Clone)]
pub enum ActivationError {
    #[error("activation call for {step} timed out after {timeout_ms}ms")]
    Timeout {
        step: ActivationStep,
        timeout_ms: u64,
    },

    #[error("activation transport failure: {0}")]
    Transport(String),

    #[error("activation request never sent: {0}")]
    Unreachable(String),

    #[error("activation rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("no activation endpoint configured for {0}")]
    NoEndpoint(ActivationStep),
}

impl ActivationError {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::Unreachable(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NoEndpoint(_) => false,
        }
    }
}

/// Result type alias for onboarding operations
pub type OnboardingResult<T> = Result<T, OnboardingError>;

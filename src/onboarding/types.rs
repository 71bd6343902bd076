//! Core types for the onboarding correlation engine.
//!
//! Inbound payloads are parsed once into these shapes at the boundary; nothing
//! deeper in the pipeline touches loosely-typed JSON except the opaque engine
//! variable map.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OnboardingError, OnboardingResult};

/// Variables passed to the external process engine.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ─── Activation Steps ────────────────────────────────────────────────────────

/// The four asynchronous activation steps that follow approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStep {
    PreActivation,
    Tv,
    FinalActivation,
    Commissioning,
}

impl ActivationStep {
    pub const ALL: [ActivationStep; 4] = [
        Self::PreActivation,
        Self::Tv,
        Self::FinalActivation,
        Self::Commissioning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreActivation => "pre_activation",
            Self::Tv => "tv",
            Self::FinalActivation => "final_activation",
            Self::Commissioning => "commissioning",
        }
    }

    /// Callback path segment (`/callback/{target}/{corr}`).
    pub fn target(&self) -> &'static str {
        match self {
            Self::PreActivation => "preact",
            Self::Tv => "tv",
            Self::FinalActivation => "finalact",
            Self::Commissioning => "commission",
        }
    }

    /// Leading segment of a correlation token issued for this step.
    pub fn token_prefix(&self) -> &'static str {
        match self {
            Self::PreActivation => "PRE",
            Self::Tv => "TV",
            Self::FinalActivation => "FIN",
            Self::Commissioning => "COM",
        }
    }

    fn status_label(&self) -> &'static str {
        match self {
            Self::PreActivation => "PREACT",
            Self::Tv => "TV",
            Self::FinalActivation => "FINALACT",
            Self::Commissioning => "COMMISSION",
        }
    }

    /// Domain signal forwarded to the engine for an acknowledgment.
    pub fn signal_name(&self, ack: AckStatus) -> &'static str {
        match (self, ack) {
            (Self::PreActivation, AckStatus::Success) => "preActAckSignal",
            (Self::PreActivation, AckStatus::Failure) => "preActNackSignal",
            (Self::Tv, AckStatus::Success) => "tvAckSignal",
            (Self::Tv, AckStatus::Failure) => "tvNackSignal",
            (Self::FinalActivation, AckStatus::Success) => "finalActAckSignal",
            (Self::FinalActivation, AckStatus::Failure) => "finalActNackSignal",
            (Self::Commissioning, AckStatus::Success) => "commissionAckSignal",
            (Self::Commissioning, AckStatus::Failure) => "commissionNackSignal",
        }
    }

    pub fn from_target(target: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.target() == target)
    }

    pub fn from_token_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.token_prefix() == prefix)
    }

    /// Accepts either the snake_case name or the callback target.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s || step.target() == s)
    }
}

impl fmt::Display for ActivationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// How an activation step reaches the telco side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteMode {
    /// Synchronous API call carrying a callback URL.
    Api,
    /// Row inserted into the staging table, picked up asynchronously.
    Staging,
}

impl RouteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "API",
            Self::Staging => "STAGING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API" => Some(Self::Api),
            "STAGING" => Some(Self::Staging),
            _ => None,
        }
    }
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-zone routing configuration (externally administered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_code: String,
    pub preact_mode: RouteMode,
    pub tv_mode: RouteMode,
    pub finalact_mode: RouteMode,
    pub commission_mode: RouteMode,
}

impl ZoneConfig {
    pub fn mode_for(&self, step: ActivationStep) -> RouteMode {
        match step {
            ActivationStep::PreActivation => self.preact_mode,
            ActivationStep::Tv => self.tv_mode,
            ActivationStep::FinalActivation => self.finalact_mode,
            ActivationStep::Commissioning => self.commission_mode,
        }
    }
}

// ─── Record Status ───────────────────────────────────────────────────────────

/// Lifecycle status of an onboarding record.
///
/// Stored as text: `NEW`, `STARTED`, ..., and `<STEP>_PENDING` /
/// `<STEP>_ACKED` / `<STEP>_FAILED` for the activation substates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RecordStatus {
    New,
    IdentityFailed,
    Started,
    AwaitingApproval,
    Approved,
    Rejected,
    StepPending(ActivationStep),
    StepAcked(ActivationStep),
    StepFailed(ActivationStep),
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// Statuses from which the next activation step may be dispatched.
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, Self::Approved | Self::StepAcked(_))
    }

    pub fn parse(s: &str) -> Option<Self> {
        let fixed = match s {
            "NEW" => Some(Self::New),
            "IDENTITY_FAILED" => Some(Self::IdentityFailed),
            "STARTED" => Some(Self::Started),
            "AWAITING_APPROVAL" => Some(Self::AwaitingApproval),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        };
        if fixed.is_some() {
            return fixed;
        }

        let (label, suffix) = s.rsplit_once('_')?;
        let step = ActivationStep::ALL
            .into_iter()
            .find(|step| step.status_label() == label)?;
        match suffix {
            "PENDING" => Some(Self::StepPending(step)),
            "ACKED" => Some(Self::StepAcked(step)),
            "FAILED" => Some(Self::StepFailed(step)),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("NEW"),
            Self::IdentityFailed => f.write_str("IDENTITY_FAILED"),
            Self::Started => f.write_str("STARTED"),
            Self::AwaitingApproval => f.write_str("AWAITING_APPROVAL"),
            Self::Approved => f.write_str("APPROVED"),
            Self::Rejected => f.write_str("REJECTED"),
            Self::StepPending(step) => write!(f, "{}_PENDING", step.status_label()),
            Self::StepAcked(step) => write!(f, "{}_ACKED", step.status_label()),
            Self::StepFailed(step) => write!(f, "{}_FAILED", step.status_label()),
            Self::Completed => f.write_str("COMPLETED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

impl From<RecordStatus> for String {
    fn from(status: RecordStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for RecordStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown record status '{}'", value))
    }
}

// ─── Onboarding Record ───────────────────────────────────────────────────────

/// One CAF onboarding case. Never deleted; doubles as the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingRecord {
    /// Internal surrogate id. Never sent to the engine.
    pub id: i64,
    /// Caller-supplied CAF reference number; the business key.
    pub business_ref: String,
    pub zone_code: String,
    pub plan_code: String,
    pub identity_bearing: bool,
    /// Identity assigned by the provisioner (USIM plans).
    pub permanent_identity: Option<String>,
    /// Identity supplied on the inbound event (non-USIM plans).
    pub sim_identity: Option<String>,
    pub pos_hrno: Option<String>,
    pub is_agent: bool,
    pub status: RecordStatus,
    /// Set at most once, from null to a value.
    pub process_instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingRecord {
    /// Identity sent to the activation side: provisioned if any, else supplied.
    pub fn activation_identity(&self) -> Option<&str> {
        self.permanent_identity
            .as_deref()
            .or(self.sim_identity.as_deref())
    }

    pub fn needs_provisioning(&self) -> bool {
        self.identity_bearing && self.permanent_identity.is_none()
    }
}

/// Fields required to create an onboarding record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOnboardingRecord {
    pub business_ref: String,
    pub zone_code: String,
    pub plan_code: String,
    pub identity_bearing: bool,
    pub sim_identity: Option<String>,
    pub pos_hrno: Option<String>,
    pub is_agent: bool,
}

// ─── Inbound CAF Event ───────────────────────────────────────────────────────

/// Longest business reference, in bytes, that a correlation token can carry.
pub const MAX_BUSINESS_REF_LEN: usize = 128;

#[derive(Debug, Deserialize)]
struct RawCafEvent {
    caf_ref_no: String,
    plan_code: String,
    zone_code: String,
    #[serde(default)]
    pos_hrno: Option<String>,
    #[serde(default)]
    is_agent: bool,
    #[serde(default)]
    is_usim: Option<bool>,
    #[serde(default)]
    imsi: Option<String>,
}

/// A validated onboarding-request event taken off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafEvent {
    pub caf_ref_no: String,
    pub plan_code: String,
    pub zone_code: String,
    pub pos_hrno: Option<String>,
    pub is_agent: bool,
    pub identity_bearing: bool,
    pub imsi: Option<String>,
}

impl CafEvent {
    /// Parse and validate a raw queue payload.
    pub fn parse(raw: &[u8]) -> OnboardingResult<Self> {
        let event: RawCafEvent = serde_json::from_slice(raw)
            .map_err(|e| OnboardingError::malformed_event(e.to_string()))?;

        let caf_ref_no = required(event.caf_ref_no, "caf_ref_no")?;
        if caf_ref_no.len() > MAX_BUSINESS_REF_LEN {
            return Err(OnboardingError::malformed_event(format!(
                "field 'caf_ref_no' exceeds {} bytes",
                MAX_BUSINESS_REF_LEN
            )));
        }
        let plan_code = required(event.plan_code, "plan_code")?;
        let zone_code = required(event.zone_code, "zone_code")?;

        let identity_bearing = event
            .is_usim
            .unwrap_or_else(|| plan_code.to_ascii_uppercase().contains("USIM"));

        Ok(Self {
            caf_ref_no,
            plan_code,
            zone_code,
            pos_hrno: non_empty(event.pos_hrno),
            is_agent: event.is_agent,
            identity_bearing,
            imsi: non_empty(event.imsi),
        })
    }

    pub fn to_new_record(&self) -> NewOnboardingRecord {
        NewOnboardingRecord {
            business_ref: self.caf_ref_no.clone(),
            zone_code: self.zone_code.clone(),
            plan_code: self.plan_code.clone(),
            identity_bearing: self.identity_bearing,
            sim_identity: if self.identity_bearing {
                None
            } else {
                self.imsi.clone()
            },
            pos_hrno: self.pos_hrno.clone(),
            is_agent: self.is_agent,
        }
    }
}

fn required(value: String, field: &str) -> OnboardingResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(OnboardingError::malformed_event(format!(
            "field '{}' is empty",
            field
        )));
    }
    Ok(trimmed.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ─── Correlation Tokens ──────────────────────────────────────────────────────

/// An issued, step-scoped correlation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationToken {
    pub step: ActivationStep,
    pub business_ref: String,
    pub issued_at: DateTime<Utc>,
    /// Opaque wire form carried in the callback URL.
    pub token: String,
}

/// The latest token issued for a (step, business_ref) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: CorrelationToken,
    /// Set once a callback bearing this token has been applied.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn is_outstanding(&self) -> bool {
        self.consumed_at.is_none()
    }
}

// ─── Callbacks and Decisions ─────────────────────────────────────────────────

/// Acknowledgment status reported by an activation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Success,
    Failure,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl FromStr for AckStatus {
    type Err = OnboardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" | "OK" | "ACK" | "ACKED" => Ok(Self::Success),
            "FAILURE" | "FAILED" | "NACK" | "ERROR" | "REJECTED" => Ok(Self::Failure),
            other => Err(OnboardingError::malformed_event(format!(
                "unrecognised ackStatus '{}'",
                other
            ))),
        }
    }
}

/// Human approval decision forwarded to the pending task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub user: String,
}

/// Lifecycle notifications emitted by the process engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineEvent {
    /// The human approval task has been created.
    ApprovalTaskCreated,
    ProcessCompleted,
    ProcessFailed,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_status_text_form() {
        assert_eq!(RecordStatus::AwaitingApproval.to_string(), "AWAITING_APPROVAL");
        assert_eq!(
            RecordStatus::StepPending(ActivationStep::PreActivation).to_string(),
            "PREACT_PENDING"
        );
        assert_eq!(
            RecordStatus::parse("COMMISSION_ACKED"),
            Some(RecordStatus::StepAcked(ActivationStep::Commissioning))
        );
        // FAILED alone is the record-level terminal state, not a step substate.
        assert_eq!(RecordStatus::parse("FAILED"), Some(RecordStatus::Failed));
        assert_eq!(
            RecordStatus::parse("TV_FAILED"),
            Some(RecordStatus::StepFailed(ActivationStep::Tv))
        );
        assert_eq!(RecordStatus::parse("TV_DONE"), None);
        assert_eq!(RecordStatus::parse("bogus"), None);
    }

    #[test]
    fn test_record_status_serde_as_string() {
        let json = serde_json::to_string(&RecordStatus::StepFailed(ActivationStep::FinalActivation))
            .unwrap();
        assert_eq!(json, "\"FINALACT_FAILED\"");
        let parsed: RecordStatus = serde_json::from_str("\"IDENTITY_FAILED\"").unwrap();
        assert_eq!(parsed, RecordStatus::IdentityFailed);
        assert!(serde_json::from_str::<RecordStatus>("\"NOPE\"").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RecordStatus::Completed.is_terminal());
        assert!(RecordStatus::Failed.is_terminal());
        assert!(RecordStatus::Rejected.is_terminal());
        assert!(!RecordStatus::StepFailed(ActivationStep::Tv).is_terminal());
        assert!(RecordStatus::StepAcked(ActivationStep::Tv).accepts_dispatch());
        assert!(!RecordStatus::StepPending(ActivationStep::Tv).accepts_dispatch());
    }

    #[test]
    fn test_parse_caf_event_derives_identity_flag() {
        let event = CafEvent::parse(
            br#"{"caf_ref_no":"CAF-1","plan_code":"usim-premium","zone_code":"Z1","is_agent":false}"#,
        )
        .unwrap();
        assert_eq!(event.caf_ref_no, "CAF-1");
        assert!(event.identity_bearing);
        assert!(event.pos_hrno.is_none());

        let explicit = CafEvent::parse(
            br#"{"caf_ref_no":"CAF-2","plan_code":"USIM-X","zone_code":"Z1","is_usim":false,"imsi":"IMSI-1"}"#,
        )
        .unwrap();
        assert!(!explicit.identity_bearing);
        assert_eq!(explicit.to_new_record().sim_identity.as_deref(), Some("IMSI-1"));
    }

    #[test]
    fn test_parse_caf_event_rejects_bad_shapes() {
        let missing = CafEvent::parse(br#"{"plan_code":"P","zone_code":"Z1"}"#);
        assert!(matches!(missing, Err(OnboardingError::MalformedEvent { .. })));

        let wrong_type = CafEvent::parse(
            br#"{"caf_ref_no":"CAF-1","plan_code":"P","zone_code":"Z1","is_agent":"yes"}"#,
        );
        assert!(matches!(wrong_type, Err(OnboardingError::MalformedEvent { .. })));

        let blank = CafEvent::parse(br#"{"caf_ref_no":"  ","plan_code":"P","zone_code":"Z1"}"#);
        assert!(matches!(blank, Err(OnboardingError::MalformedEvent { .. })));

        assert!(CafEvent::parse(b"not json").is_err());
    }

    #[test]
    fn test_parse_caf_event_bounds_reference_length() {
        let event = |len: usize| {
            serde_json::json!({
                "caf_ref_no": "9".repeat(len),
                "plan_code": "P",
                "zone_code": "Z1",
            })
            .to_string()
        };

        let at_limit = CafEvent::parse(event(MAX_BUSINESS_REF_LEN).as_bytes()).unwrap();
        assert_eq!(at_limit.caf_ref_no.len(), MAX_BUSINESS_REF_LEN);

        let over = CafEvent::parse(event(MAX_BUSINESS_REF_LEN + 1).as_bytes());
        assert!(matches!(over, Err(OnboardingError::MalformedEvent { .. })));
    }

    #[test]
    fn test_ack_status_parse() {
        assert_eq!("success".parse::<AckStatus>().unwrap(), AckStatus::Success);
        assert_eq!("NACK".parse::<AckStatus>().unwrap(), AckStatus::Failure);
        assert!("maybe".parse::<AckStatus>().is_err());
    }

    #[test]
    fn test_step_names() {
        assert_eq!(ActivationStep::from_target("preact"), Some(ActivationStep::PreActivation));
        assert_eq!(ActivationStep::parse("final_activation"), Some(ActivationStep::FinalActivation));
        assert_eq!(ActivationStep::parse("commission"), Some(ActivationStep::Commissioning));
        assert_eq!(
            ActivationStep::PreActivation.signal_name(AckStatus::Success),
            "preActAckSignal"
        );
        assert_eq!(RouteMode::parse("staging"), Some(RouteMode::Staging));
    }
}

//! Onboarding configuration: YAML file plus environment overrides.
//!
//! Loaded once at startup and handed to each component explicitly. The file
//! path comes from `CAF_ONBOARDING_CONFIG` (default `config/onboarding.yaml`);
//! a missing file means defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::onboarding::types::{ActivationStep, ZoneConfig};

const DEFAULT_CONFIG_PATH: &str = "config/onboarding.yaml";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnboardingConfig {
    pub engine: EngineConfig,
    pub provisioner: ProvisionerConfig,
    pub activation: ActivationConfig,
    /// Per-step policy, keyed by step name.
    pub steps: StepPolicies,
    pub retry: RetryPolicy,
    pub ingestion: IngestionConfig,
    /// Inline zone routing, used when the database holds no zone configs.
    pub zones: Vec<ZoneConfig>,
    pub server: ServerConfig,
}

impl OnboardingConfig {
    /// Load `.env`, the YAML file (if present), then environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("CAF_ONBOARDING_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);

        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::info!(
                path = %path.display(),
                "No onboarding config file found, using defaults"
            );
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FLOWABLE_BASE_URL") {
            self.engine.base_url = url;
        }
        if let Ok(url) = std::env::var("PROVISIONER_BASE_URL") {
            self.provisioner.base_url = url;
        }
        if let Ok(url) = std::env::var("CALLBACK_BASE_URL") {
            self.activation.callback_base_url = url;
        }
        if let Some(port) = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
    }
}

/// Flowable REST connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    /// Process definition key started for every CAF.
    pub process_key: String,
    /// Task definition key of the human approval user task.
    pub approval_task_key: String,
    pub timeout_ms: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/flowable-rest/service".to_string(),
            process_key: "cafOnboarding".to_string(),
            approval_task_key: "cscApproval".to_string(),
            timeout_ms: 10_000,
            username: None,
            password: None,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8090".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl ProvisionerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outbound activation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Public base URL of this service, used to build callback URLs.
    pub callback_base_url: String,
    /// Synchronous API endpoint per step (API route only).
    pub endpoints: BTreeMap<ActivationStep, String>,
    pub timeout_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:3000".to_string(),
            endpoints: BTreeMap::new(),
            timeout_ms: 10_000,
        }
    }
}

impl ActivationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `{callback_base}/callback/{target}/{token}`
    pub fn callback_url(&self, step: ActivationStep, token: &str) -> String {
        format!(
            "{}/callback/{}/{}",
            self.callback_base_url.trim_end_matches('/'),
            step.target(),
            token
        )
    }
}

/// Handling of a single activation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// A negative acknowledgment on a critical step fails the whole record;
    /// on a non-critical step it parks the step for manual retry.
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepPolicies(pub BTreeMap<ActivationStep, StepPolicy>);

impl Default for StepPolicies {
    fn default() -> Self {
        Self(
            ActivationStep::ALL
                .into_iter()
                .map(|step| {
                    let critical = !matches!(step, ActivationStep::Tv);
                    (step, StepPolicy { critical })
                })
                .collect(),
        )
    }
}

impl StepPolicies {
    /// Steps missing from the table are treated as critical.
    pub fn is_critical(&self, step: ActivationStep) -> bool {
        self.0.get(&step).map(|p| p.critical).unwrap_or(true)
    }
}

/// Internal retry for ambiguous engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1` (1-based), capped at 30s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor).min(30_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Number of serial ingestion lanes (one per queue partition).
    pub lanes: usize,
    pub channel_capacity: usize,
    /// Delay before a message is redelivered after a retryable failure.
    pub redelivery_backoff_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            channel_capacity: 1024,
            redelivery_backoff_ms: 1_000,
        }
    }
}

impl IngestionConfig {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

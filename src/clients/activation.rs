//! Synchronous activation API adapter: one configured endpoint per step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::ActivationConfig;
use crate::error::ActivationError;
use crate::onboarding::activation::{ActivationApi, ActivationRequest};
use crate::onboarding::types::ActivationStep;

#[derive(Debug, Clone)]
pub struct HttpActivationApi {
    client: Client,
    endpoints: BTreeMap<ActivationStep, String>,
    timeout_ms: u64,
}

impl HttpActivationApi {
    pub fn new(config: &ActivationConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            endpoints: config.endpoints.clone(),
            timeout_ms: config.timeout_ms,
        })
    }
}

#[async_trait]
impl ActivationApi for HttpActivationApi {
    async fn send(&self, step: ActivationStep, request: &ActivationRequest) -> Result<(), ActivationError> {
        let endpoint = self
            .endpoints
            .get(&step)
            .ok_or(ActivationError::NoEndpoint(step))?;

        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ActivationError::Timeout {
                        step,
                        timeout_ms: self.timeout_ms,
                    }
                } else if e.is_connect() {
                    ActivationError::Unreachable(e.to_string())
                } else {
                    ActivationError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                business_ref = %request.caf_ref_no,
                step = %step,
                status = %status,
                "Activation request accepted"
            );
            return Ok(());
        }
        Err(ActivationError::Rejected {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}
